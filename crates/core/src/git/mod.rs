//! Git operations for gitbridge.

pub mod client;

pub use client::{set_transport_timeouts, Deadline, GitClient, ORIGIN};
