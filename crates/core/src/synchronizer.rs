//! Mirroring one project into its linked repository.
//!
//! [`RepositorySynchronizer::sync`] runs the whole attempt for a single
//! project and always returns a [`SyncOutcome`]; no error escapes it.
//!
//! 1. Clone the remote, or open the existing clone, realign `origin` with the
//!    descriptor and fetch.
//! 2. Replace the clone's content with the project's output.
//! 3. Stage everything and compare with HEAD; nothing new means `NoOp`.
//! 4. Refuse to go on when the remote branch is not an ancestor of HEAD.
//! 5. Commit.
//! 6. Push the checked-out branch. A failed push rolls the commit back.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use git2::Oid;
use tracing::{debug, info, instrument, warn};

use crate::commit_format::CommitFormatter;
use crate::config::BridgeConfig;
use crate::credentials::CredentialProvider;
use crate::errors::ConfigError;
use crate::file_policy::FilePolicy;
use crate::git::{self, Deadline, GitClient};
use crate::gitignore;
use crate::models::{Project, SyncFailure, SyncOutcome};
use crate::workspace;

/// Performs sync attempts. Shared across the blocking tasks of a cycle.
#[derive(Debug, Clone)]
pub struct RepositorySynchronizer {
    clones_dir: PathBuf,
    descriptor_file: String,
    author_name: String,
    author_email: String,
    git_timeout: Duration,
    formatter: CommitFormatter,
    credentials: CredentialProvider,
    policy: FilePolicy,
    ignore_template: String,
}

impl RepositorySynchronizer {
    /// Build a synchronizer from validated configuration.
    ///
    /// Reads the operator's ignore template when one is configured; an
    /// unreadable or empty template is a configuration error. Also applies
    /// `git_timeout` to libgit2's transport timeouts.
    pub fn new(config: &BridgeConfig, credentials: CredentialProvider) -> Result<Self, ConfigError> {
        let ignore_template = load_ignore_template(config.paths.gitignore_template.as_deref())?;
        git::set_transport_timeouts(config.git_timeout()).map_err(|e| ConfigError::InvalidValue {
            field: "git.timeout_secs".into(),
            detail: e.to_string(),
        })?;
        let policy = FilePolicy::from(&config.content);
        if policy.has_constraints() {
            info!(
                exclude_patterns = config.content.exclude_patterns.len(),
                max_file_size = config.content.max_file_size,
                "content filter active"
            );
        }
        Ok(Self {
            clones_dir: config.paths.clones_dir.clone(),
            descriptor_file: config.paths.descriptor_file.clone(),
            author_name: config.git.user_name.clone(),
            author_email: config.git.user_email.clone(),
            git_timeout: config.git_timeout(),
            formatter: CommitFormatter::new(config.git.commit_message_template.clone()),
            credentials,
            policy,
            ignore_template,
        })
    }

    /// Where the persistent clone for `project` lives.
    pub fn clone_dir(&self, project: &Project) -> PathBuf {
        self.clones_dir
            .join(workspace::clone_key(&project.path, &project.folder_name))
    }

    pub fn ignore_template(&self) -> &str {
        &self.ignore_template
    }

    /// Run one attempt for `project`. Blocking.
    #[instrument(skip(self, project), fields(project = %project.folder_name))]
    pub fn sync(&self, project: &Project) -> SyncOutcome {
        match self.try_sync(project) {
            Ok(outcome) => outcome,
            Err(failure) => SyncOutcome::failed(failure),
        }
    }

    fn try_sync(&self, project: &Project) -> Result<SyncOutcome, SyncFailure> {
        let clone_dir = self.clone_dir(project);
        let url = project.descriptor.repo_url.as_str();

        let client = self.prepare_clone(&clone_dir, url)?;
        let branch = client.current_branch().map_err(|e| self.local(e))?;

        workspace::replace_content(
            &project.path,
            &clone_dir,
            &self.descriptor_file,
            &self.policy,
            &self.ignore_template,
        )
        .map_err(|e| self.local(e))?;

        let tree = client.stage_all().map_err(|e| self.local(e))?;
        let head = client.head_commit().map_err(|e| self.local(e))?;
        let head_tree = client.head_tree().map_err(|e| self.local(e))?;
        let upstream = client.upstream(&branch).map_err(|e| self.local(e))?;
        let changed = head_tree != Some(tree);

        if !changed {
            if let (Some(head), Some(upstream)) = (head, upstream) {
                if client.contains(upstream, head).map_err(|e| self.local(e))? {
                    debug!(%branch, "content unchanged and already published");
                    return Ok(SyncOutcome::NoOp);
                }
            }
        }

        if let Some(upstream) = upstream {
            let descends = match head {
                Some(head) => client.contains(head, upstream).map_err(|e| self.local(e))?,
                None => false,
            };
            if !descends {
                warn!(%branch, "remote branch has commits the clone lacks; not committing");
                return Err(SyncFailure::RemoteAhead { branch });
            }
        }

        let auth = self
            .credentials
            .authenticate(url)
            .map_err(|e| self.local(e))?;

        let (commit, created) = match (changed, head) {
            (true, _) => {
                let message = self
                    .formatter
                    .format(&project.folder_name, &project.path, Utc::now());
                let oid = client
                    .commit_tree(tree, &message, &self.author_name, &self.author_email)
                    .map_err(|e| self.local(e))?;
                (oid, true)
            }
            (false, Some(head)) => {
                info!(%branch, sha = %head, "pushing commit the remote has not seen");
                (head, false)
            }
            (false, None) => return Ok(SyncOutcome::NoOp),
        };

        let pushed = client.push(&branch, &auth, &self.credentials, self.deadline());
        drop(auth);

        if let Err(err) = pushed {
            if created {
                self.roll_back(&client, &branch, head);
            }
            if err.is_non_fast_forward() {
                warn!(%branch, "push rejected as non-fast-forward");
                return Err(SyncFailure::RemoteAhead { branch });
            }
            return Err(self.transport(err));
        }

        if let Err(e) = client.update_tracking_ref(&branch, commit) {
            warn!(%branch, error = %e, "pushed, but could not record remote-tracking ref");
        }
        info!(%branch, sha = %commit, created, "pushed");
        Ok(SyncOutcome::CommittedAndPushed {
            commit: commit.to_string(),
            created,
        })
    }

    /// Open or create the clone and bring its view of `origin` up to date.
    fn prepare_clone(&self, clone_dir: &Path, url: &str) -> Result<GitClient, SyncFailure> {
        if clone_dir.exists() {
            match GitClient::new(clone_dir) {
                Ok(client) => {
                    let current = client.origin_url().map_err(|e| self.local(e))?;
                    if current.as_deref() != Some(url) {
                        info!(
                            old = current.as_deref().unwrap_or("<none>"),
                            new = url,
                            "remote URL changed, reconfiguring origin"
                        );
                        client.set_origin_url(url).map_err(|e| self.local(e))?;
                    }
                    client
                        .fetch(&self.credentials, self.deadline())
                        .map_err(|e| self.transport(e))?;
                    return Ok(client);
                }
                Err(e) => {
                    warn!(path = %clone_dir.display(), error = %e, "clone directory is not a repository, recloning");
                    std::fs::remove_dir_all(clone_dir).map_err(|e| self.local(e))?;
                }
            }
        }

        std::fs::create_dir_all(&self.clones_dir).map_err(|e| self.local(e))?;
        GitClient::clone_repo(url, clone_dir, &self.credentials, self.deadline()).map_err(|e| {
            if clone_dir.exists() {
                if let Err(cleanup) = std::fs::remove_dir_all(clone_dir) {
                    warn!(error = %cleanup, "could not remove partial clone");
                }
            }
            self.transport(e)
        })
    }

    fn roll_back(&self, client: &GitClient, branch: &str, previous: Option<Oid>) {
        if let Err(e) = client.rollback(branch, previous) {
            warn!(%branch, error = %self.credentials.redact(&e.to_string()), "rollback failed");
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.git_timeout)
    }

    fn local(&self, err: impl fmt::Display) -> SyncFailure {
        SyncFailure::Local {
            cause: self.credentials.redact(&err.to_string()),
        }
    }

    fn transport(&self, err: impl fmt::Display) -> SyncFailure {
        SyncFailure::Transport {
            cause: self.credentials.redact(&err.to_string()),
        }
    }
}

/// The operator's template from `path`, or the built-in one.
pub fn load_ignore_template(path: Option<&Path>) -> Result<String, ConfigError> {
    let Some(path) = path else {
        return Ok(gitignore::TEMPLATE.to_string());
    };
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::InvalidValue {
        field: "paths.gitignore_template".into(),
        detail: format!("cannot read '{}': {e}", path.display()),
    })?;
    if text.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "paths.gitignore_template".into(),
            detail: format!("'{}' is empty", path.display()),
        });
    }
    info!(path = %path.display(), "using custom ignore template");
    Ok(text)
}
