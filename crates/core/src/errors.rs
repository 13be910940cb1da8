//! Error types for the gitbridge core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing { var: String, field: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Link descriptor errors
// ---------------------------------------------------------------------------

/// Errors reading a project's link descriptor.
///
/// A missing descriptor is not an error; it is reported as `Ok(None)` by
/// [`crate::descriptor::read`].
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The file exists but is not a valid descriptor document.
    #[error("malformed link descriptor at '{path}': {detail}")]
    Malformed { path: PathBuf, detail: String },

    /// The file exists but could not be read.
    #[error("unreadable link descriptor at '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Credential errors
// ---------------------------------------------------------------------------

/// Errors from the credential provider.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No access token configured. Fatal for the whole process.
    #[error("no access token configured")]
    MissingToken,

    /// The token contains control characters.
    #[error("access token contains control characters")]
    InvalidToken,

    /// The remote URL could not be parsed well enough to embed credentials.
    #[error("cannot embed credentials in remote URL '{0}'")]
    InvalidUrl(String),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, remote) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The remote refused a reference update during push.
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// A network operation ran past its deadline.
    #[error("git {operation} timed out after {secs}s")]
    TimedOut { operation: String, secs: u64 },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GitError {
    /// Whether this error means the remote has history we do not.
    pub fn is_non_fast_forward(&self) -> bool {
        match self {
            Self::PushRejected { detail, .. } => is_non_fast_forward_message(detail),
            Self::Git2Error(e) => {
                e.code() == git2::ErrorCode::NotFastForward
                    || is_non_fast_forward_message(e.message())
            }
            _ => false,
        }
    }
}

/// Recognise the rejection texts servers and libgit2 use for non-fast-forward
/// pushes.
pub fn is_non_fast_forward_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("non-fast-forward")
        || msg.contains("non-fastforward")
        || msg.contains("fetch first")
        || msg.contains("not a fast forward")
        || msg.contains("not present locally")
}

// ---------------------------------------------------------------------------
// Scanner errors
// ---------------------------------------------------------------------------

/// Errors fatal to a whole scan. Per-project problems never surface here.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The compiles root could not be listed.
    #[error("compiles root '{path}' is unreadable: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Workspace errors
// ---------------------------------------------------------------------------

/// Errors while mirroring compiled output into a local clone.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// An I/O error, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// Convenience constructor for [`WorkspaceError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = GitError::RepositoryNotFound("/tmp/repo".into());
        assert_eq!(err.to_string(), "git repository not found at '/tmp/repo'");

        let err = ConfigError::EnvVarMissing {
            var: "GITHUB_TOKEN".into(),
            field: "token_env".into(),
        };
        assert!(err.to_string().contains("GITHUB_TOKEN"));

        let err = GitError::TimedOut {
            operation: "fetch".into(),
            secs: 30,
        };
        assert_eq!(err.to_string(), "git fetch timed out after 30s");
    }

    #[test]
    fn test_non_fast_forward_detection() {
        let err = GitError::PushRejected {
            branch: "main".into(),
            detail: "cannot push because a reference that you are trying to update on the remote contains commits that are not present locally; fetch first".into(),
        };
        assert!(err.is_non_fast_forward());

        let err = GitError::PushRejected {
            branch: "main".into(),
            detail: "pre-receive hook declined".into(),
        };
        assert!(!err.is_non_fast_forward());

        let err = GitError::Git2Error(git2::Error::from_str("cannot push non-fastforward reference"));
        assert!(err.is_non_fast_forward());

        let err = GitError::Git2Error(git2::Error::from_str("failed to resolve address"));
        assert!(!err.is_non_fast_forward());

        assert!(is_non_fast_forward_message("! [rejected] main -> main (fetch first)"));
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core_err: CoreError = CredentialError::MissingToken.into();
        assert!(matches!(core_err, CoreError::Credential(_)));

        let core_err: CoreError = ScanError::RootUnreadable {
            path: "/nope".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .into();
        assert!(matches!(core_err, CoreError::Scan(_)));
    }
}
