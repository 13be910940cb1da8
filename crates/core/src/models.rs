//! Domain model types shared by the scanner, synchronizer and scheduler.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptor::LinkDescriptor;

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A linked compiled project discovered during a scan.
#[derive(Debug, Clone)]
pub struct Project {
    /// Absolute path of the project directory; the project's identity.
    pub path: PathBuf,
    /// Directory name, used in commit messages and clone keys.
    pub folder_name: String,
    /// Most recent modification time found in the project tree.
    pub compiled_at: SystemTime,
    pub descriptor: LinkDescriptor,
}

// ---------------------------------------------------------------------------
// Sync outcome
// ---------------------------------------------------------------------------

/// Result of one synchronization attempt for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Output identical to the clone's commit; nothing committed or pushed.
    NoOp,
    /// The branch was pushed. `created` is false when an earlier commit that
    /// never reached the remote was pushed without a new one.
    CommittedAndPushed { commit: String, created: bool },
    /// The attempt did not run.
    Skipped { reason: String },
    /// The attempt ran and failed.
    Failed { failure: SyncFailure },
}

impl SyncOutcome {
    pub fn failed(failure: SyncFailure) -> Self {
        Self::Failed { failure }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Short label for logs and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoOp => "no-op",
            Self::CommittedAndPushed { .. } => "committed-and-pushed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { failure } => match failure {
                SyncFailure::RemoteAhead { .. } => "failed: remote-ahead",
                SyncFailure::Transport { .. } => "failed: transport",
                SyncFailure::Local { .. } => "failed: local",
            },
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::CommittedAndPushed { commit, created } => {
                let short = &commit[..8.min(commit.len())];
                if *created {
                    write!(f, "committed-and-pushed {short}")
                } else {
                    write!(f, "pushed pending commit {short}")
                }
            }
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed { failure } => write!(f, "{failure}"),
        }
    }
}

/// Why an attempt failed. Causes are already scrubbed of credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncFailure {
    /// The remote branch has commits the clone lacks. Needs a human.
    RemoteAhead { branch: String },
    /// Network, authentication or timeout failure talking to the remote.
    Transport { cause: String },
    /// Filesystem or repository failure on this machine.
    Local { cause: String },
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteAhead { branch } => {
                write!(f, "failed: remote-ahead (branch '{branch}' diverged; reconcile manually)")
            }
            Self::Transport { cause } => write!(f, "failed: transport: {cause}"),
            Self::Local { cause } => write!(f, "failed: local: {cause}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Outcome of one project within a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub path: PathBuf,
    pub folder_name: String,
    pub outcome: SyncOutcome,
}

/// Everything that happened in one scan-and-sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub projects: Vec<ProjectReport>,
    /// Linked projects left out because their output is older than the window.
    pub stale: usize,
    /// Projects whose descriptor could not be parsed.
    pub malformed: usize,
    /// Set when shutdown cut the cycle short.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn count(&self, label: &str) -> usize {
        self.projects
            .iter()
            .filter(|p| p.outcome.label() == label)
            .count()
    }

    pub fn pushed(&self) -> usize {
        self.count("committed-and-pushed")
    }

    pub fn no_ops(&self) -> usize {
        self.count("no-op")
    }

    pub fn skipped(&self) -> usize {
        self.count("skipped")
    }

    pub fn failures(&self) -> usize {
        self.projects.iter().filter(|p| p.outcome.is_failure()).count()
    }
}
