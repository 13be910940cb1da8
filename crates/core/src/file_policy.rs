//! Which files of a compiled project are mirrored.
//!
//! Provides [`FilePolicy`] which encapsulates `max_file_size` and
//! `exclude_patterns` from [`ContentConfig`] and evaluates each candidate
//! file before it is copied into a local clone.
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path matches an exclude pattern | `Ignored` |
//! | Size exceeds `max_file_size` (when > 0) | `Oversize` |
//! | None of the above | `Allow` |

use tracing::{debug, warn};

use crate::config::ContentConfig;

/// The outcome of evaluating a file against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePolicyDecision {
    Allow,
    /// File matches an exclude pattern.
    Ignored { pattern: String },
    /// File exceeds the configured `max_file_size`.
    Oversize { size: u64, limit: u64 },
}

impl FilePolicyDecision {
    pub fn should_copy(&self) -> bool {
        matches!(self, Self::Allow)
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignored { .. } => "ignored",
            Self::Oversize { .. } => "oversize",
        }
    }
}

/// Evaluates candidate files against size limits and exclude patterns.
#[derive(Debug, Clone, Default)]
pub struct FilePolicy {
    /// Maximum allowed file size in bytes. 0 = no limit.
    max_file_size: u64,
    /// Glob patterns matched against the *relative* path.
    exclude_patterns: Vec<String>,
}

impl FilePolicy {
    pub fn new(max_file_size: u64, exclude_patterns: Vec<String>) -> Self {
        Self {
            max_file_size,
            exclude_patterns,
        }
    }

    /// Evaluate a file.
    ///
    /// `rel_path` is the file's path relative to the project root
    /// (forward-slash separated). `size` is the file size in bytes.
    pub fn evaluate(&self, rel_path: &str, size: u64) -> FilePolicyDecision {
        let path = rel_path.replace('\\', "/");
        for pattern in &self.exclude_patterns {
            if glob_match::glob_match(pattern, &path) {
                debug!(path = rel_path, pattern = pattern.as_str(), "file matches exclude pattern");
                return FilePolicyDecision::Ignored {
                    pattern: pattern.clone(),
                };
            }
        }

        if self.max_file_size > 0 && size > self.max_file_size {
            warn!(
                path = rel_path,
                size,
                limit = self.max_file_size,
                "file exceeds max_file_size, not mirrored"
            );
            return FilePolicyDecision::Oversize {
                size,
                limit: self.max_file_size,
            };
        }

        FilePolicyDecision::Allow
    }

    /// Whether a directory can be skipped wholesale (`dir/**` style patterns).
    pub fn excludes_dir(&self, rel_dir: &str) -> bool {
        let dir = rel_dir.replace('\\', "/");
        self.exclude_patterns.iter().any(|pattern| {
            glob_match::glob_match(pattern, &dir)
                || pattern
                    .strip_suffix("/**")
                    .is_some_and(|prefix| glob_match::glob_match(prefix, &dir))
        })
    }

    pub fn has_constraints(&self) -> bool {
        self.max_file_size > 0 || !self.exclude_patterns.is_empty()
    }
}

impl From<&ContentConfig> for FilePolicy {
    fn from(content: &ContentConfig) -> Self {
        Self::new(content.max_file_size, content.exclude_patterns.clone())
    }
}
