//! Link descriptor reader.
//!
//! A compiled project opts into mirroring by carrying a small JSON document
//! (`.gitinfo` by default) naming the repository its output is pushed to:
//!
//! ```json
//! {"gitrepo": "https://github.com/owner/paper"}
//! ```
//!
//! Unknown fields are ignored so the format can grow without breaking older
//! bridges.

use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::errors::DescriptorError;

/// A parsed link descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkDescriptor {
    /// Target repository URL, trimmed.
    pub repo_url: String,
}

#[derive(Deserialize)]
struct RawDescriptor {
    gitrepo: Option<serde_json::Value>,
}

/// Read the descriptor named `file_name` inside `project_dir`.
///
/// Returns `Ok(None)` when the file does not exist, which is the common case
/// for projects that are not linked.
pub fn read(project_dir: &Path, file_name: &str) -> Result<Option<LinkDescriptor>, DescriptorError> {
    let path = project_dir.join(file_name);
    match std::fs::metadata(&path) {
        Ok(meta) if !meta.is_file() => return Ok(None),
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(DescriptorError::Unreadable { path, source }),
    }

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            return Err(DescriptorError::Malformed {
                path,
                detail: "file is not valid UTF-8".into(),
            })
        }
        Err(source) => return Err(DescriptorError::Unreadable { path, source }),
    };

    parse(&contents)
        .map(Some)
        .map_err(|detail| DescriptorError::Malformed { path, detail })
}

/// Parse descriptor text. The error is a human-readable reason.
pub fn parse(contents: &str) -> Result<LinkDescriptor, String> {
    let raw: RawDescriptor =
        serde_json::from_str(contents).map_err(|e| format!("invalid JSON: {e}"))?;

    let url = match raw.gitrepo {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => {
            return Err(format!(
                "'gitrepo' must be a string, found {}",
                json_type_name(&other)
            ))
        }
        None => return Err("missing required field 'gitrepo'".into()),
    };

    let url = url.trim();
    if url.is_empty() {
        return Err("'gitrepo' is empty".into());
    }

    debug!(repo_url = url, "parsed link descriptor");
    Ok(LinkDescriptor {
        repo_url: url.to_string(),
    })
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
