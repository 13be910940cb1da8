//! One scan-and-sync pass over the compiles root.
//!
//! The [`SyncEngine`] owns the pieces that outlive a single cycle: the
//! scanner, the shared synchronizer, the per-project locks and the set of
//! projects whose last attempt failed. Each cycle:
//!
//! 1. Scan the root. The recency cutoff reaches back at least to the start
//!    of the previous completed scan, so nothing compiled between two scans
//!    is missed.
//! 2. Select `Ready` projects, plus `Stale` ones on the first cycle after
//!    startup or when their previous attempt failed.
//! 3. Sync each selected project on a blocking thread, bounded by the attempt
//!    timeout, and record the outcome.
//!
//! Per-project failures are values in the [`CycleReport`]; only an
//! unreadable root fails the cycle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::errors::ScanError;
use crate::models::{CycleReport, Project, ProjectReport, SyncFailure, SyncOutcome};
use crate::scanner::{ScanEntry, Scanner};
use crate::synchronizer::RepositorySynchronizer;

// ---------------------------------------------------------------------------
// Per-project locks
// ---------------------------------------------------------------------------

/// Set of projects with an attempt in flight.
#[derive(Debug, Clone, Default)]
pub struct ProjectLocks {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `path`, or `None` if an attempt already holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<ProjectLockGuard> {
        if !self.guard().insert(path.to_path_buf()) {
            return None;
        }
        Some(ProjectLockGuard {
            held: Arc::clone(&self.held),
            path: path.to_path_buf(),
        })
    }

    /// Number of attempts still running.
    pub fn held(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held() == 0
    }

    fn guard(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a project lock on drop, including when the attempt panics.
#[derive(Debug)]
pub struct ProjectLockGuard {
    held: Arc<Mutex<HashSet<PathBuf>>>,
    path: PathBuf,
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives sync cycles.
pub struct SyncEngine {
    scanner: Scanner,
    synchronizer: Arc<RepositorySynchronizer>,
    attempt_timeout: Duration,
    locks: ProjectLocks,
    /// Projects whose last attempt failed; retried even when stale.
    retry: Mutex<HashSet<PathBuf>>,
    /// Start of the last scan whose cycle ran to completion.
    last_scan: Mutex<Option<SystemTime>>,
    first_cycle: AtomicBool,
    cycles: AtomicU64,
}

impl SyncEngine {
    pub fn new(config: &BridgeConfig, synchronizer: RepositorySynchronizer) -> Self {
        Self::from_parts(
            Scanner::from_config(config),
            synchronizer,
            config.attempt_timeout(),
        )
    }

    pub fn from_parts(
        scanner: Scanner,
        synchronizer: RepositorySynchronizer,
        attempt_timeout: Duration,
    ) -> Self {
        info!(root = %scanner.root().display(), "initializing sync engine");
        Self {
            scanner,
            synchronizer: Arc::new(synchronizer),
            attempt_timeout,
            locks: ProjectLocks::new(),
            retry: Mutex::new(HashSet::new()),
            last_scan: Mutex::new(None),
            first_cycle: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn synchronizer(&self) -> &RepositorySynchronizer {
        &self.synchronizer
    }

    pub fn locks(&self) -> &ProjectLocks {
        &self.locks
    }

    /// Number of cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Execute one full cycle. `stop` is consulted before each project.
    pub async fn run_cycle<F>(&self, stop: F) -> Result<CycleReport, ScanError>
    where
        F: Fn() -> bool,
    {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let sweep = self.first_cycle.swap(false, Ordering::SeqCst);
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let scan_started = SystemTime::now();
        let previous_scan = *self
            .last_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = self.scanner.scan_since(previous_scan)?;
        let retry = self.retry_set().clone();
        let mut seen = HashSet::new();
        info!(cycle, sweep, "sync cycle started");

        for entry in entries {
            if stop() {
                info!(cycle, "shutdown requested, ending cycle early");
                report.interrupted = true;
                break;
            }

            let project = match entry {
                ScanEntry::Ready(project) => project,
                ScanEntry::Stale(project) if sweep || retry.contains(&project.path) => {
                    debug!(project = %project.folder_name, "retrying stale project");
                    project
                }
                ScanEntry::Stale(project) => {
                    seen.insert(project.path);
                    report.stale += 1;
                    continue;
                }
                ScanEntry::Malformed { .. } => {
                    report.malformed += 1;
                    continue;
                }
            };

            let outcome = self.attempt(&project).await;
            log_outcome(cycle, &project, &outcome);
            self.remember(&project.path, &outcome);
            seen.insert(project.path.clone());
            report.projects.push(ProjectReport {
                path: project.path,
                folder_name: project.folder_name,
                outcome,
            });
        }

        if !report.interrupted {
            self.retry_set().retain(|path| seen.contains(path));
            *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = Some(scan_started);
        }

        report.completed_at = Some(Utc::now());
        info!(
            cycle,
            attempted = report.projects.len(),
            pushed = report.pushed(),
            no_op = report.no_ops(),
            skipped = report.skipped(),
            failed = report.failures(),
            stale = report.stale,
            malformed = report.malformed,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Wait until no attempt holds a lock, for at most `grace`.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while !self.locks.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    running = self.locks.held(),
                    "sync attempts still running after shutdown grace period"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        true
    }

    /// One attempt on a blocking thread. The lock moves into the task, so an
    /// attempt abandoned by the timeout keeps its project locked until it
    /// really ends.
    async fn attempt(&self, project: &Project) -> SyncOutcome {
        let Some(guard) = self.locks.try_acquire(&project.path) else {
            return SyncOutcome::Skipped {
                reason: "previous attempt still running".into(),
            };
        };

        let synchronizer = Arc::clone(&self.synchronizer);
        let task_project = project.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            synchronizer.sync(&task_project)
        });

        match tokio::time::timeout(self.attempt_timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => SyncOutcome::failed(SyncFailure::Local {
                cause: format!("sync task aborted: {join_err}"),
            }),
            Err(_) => {
                warn!(
                    project = %project.folder_name,
                    timeout_secs = self.attempt_timeout.as_secs(),
                    "attempt abandoned; it keeps the project locked until it ends"
                );
                SyncOutcome::failed(SyncFailure::Transport {
                    cause: format!(
                        "attempt abandoned after {}s; it may still complete in the background",
                        self.attempt_timeout.as_secs()
                    ),
                })
            }
        }
    }

    fn remember(&self, path: &Path, outcome: &SyncOutcome) {
        let mut retry = self.retry_set();
        match outcome {
            // A skipped project may have changed after the running attempt
            // copied it.
            SyncOutcome::Failed { .. } | SyncOutcome::Skipped { .. } => {
                retry.insert(path.to_path_buf());
            }
            SyncOutcome::NoOp | SyncOutcome::CommittedAndPushed { .. } => {
                retry.remove(path);
            }
        }
    }

    fn retry_set(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.retry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_outcome(cycle: u64, project: &Project, outcome: &SyncOutcome) {
    let name = project.folder_name.as_str();
    match outcome {
        SyncOutcome::NoOp => debug!(cycle, project = name, "no changes"),
        SyncOutcome::CommittedAndPushed { commit, created } => {
            info!(cycle, project = name, sha = %commit, created, "synced")
        }
        SyncOutcome::Skipped { reason } => {
            info!(cycle, project = name, reason = reason.as_str(), "skipped")
        }
        SyncOutcome::Failed { failure } => {
            warn!(cycle, project = name, remote = %project.descriptor.repo_url, %failure, "sync failed")
        }
    }
}
