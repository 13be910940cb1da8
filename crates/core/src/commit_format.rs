//! Commit message formatting for mirrored projects.

use std::path::Path;

use chrono::{DateTime, Utc};

/// Formats commit messages from a configurable template.
///
/// Understands `{folder_name}`, `{timestamp}` and `{project_path}`; anything
/// else in braces is left verbatim.
#[derive(Debug, Clone)]
pub struct CommitFormatter {
    template: String,
}

impl CommitFormatter {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Render the message for one sync of the project at `project_path`.
    pub fn format(&self, folder_name: &str, project_path: &Path, at: DateTime<Utc>) -> String {
        let message = self
            .template
            .replace("{folder_name}", folder_name)
            .replace("{timestamp}", &at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .replace("{project_path}", &project_path.display().to_string());
        let message = message.trim();
        if message.is_empty() {
            format!("Update {folder_name}")
        } else {
            message.to_string()
        }
    }
}
