//! gitbridge core library.
//!
//! One-way mirroring of compiled document projects into linked Git
//! repositories: configuration, link descriptors, credentials, the managed
//! ignore section, project discovery, the per-project synchronizer and the
//! cycle engine that ties them together.

pub mod commit_format;
pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod errors;
pub mod file_policy;
pub mod git;
pub mod gitignore;
pub mod models;
pub mod scanner;
pub mod sync_engine;
pub mod synchronizer;
pub mod workspace;

// Re-exports for convenience.
pub use config::BridgeConfig;
pub use credentials::CredentialProvider;
pub use models::{CycleReport, Project, SyncFailure, SyncOutcome};
pub use scanner::{ScanEntry, Scanner};
pub use sync_engine::SyncEngine;
pub use synchronizer::RepositorySynchronizer;
