//! Discovery of linked projects under the compiles root.
//!
//! [`Scanner::scan`] lists the root lazily. Each immediate subdirectory that
//! carries a link descriptor becomes a [`ScanEntry`]; directories without one
//! are passed over silently. Only an unreadable root fails the scan.

use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::BridgeConfig;
use crate::descriptor;
use crate::errors::ScanError;
use crate::models::Project;

/// One linked (or attempted-to-be-linked) project seen by a scan.
#[derive(Debug, Clone)]
pub enum ScanEntry {
    /// Valid descriptor and recently compiled.
    Ready(Project),
    /// Valid descriptor, but output older than the recency window.
    Stale(Project),
    /// Descriptor present but unusable this cycle.
    Malformed { path: PathBuf, reason: String },
}

/// Walks the compiles root.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    descriptor_file: String,
    recent_window: Option<Duration>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, descriptor_file: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            descriptor_file: descriptor_file.into(),
            recent_window: None,
        }
    }

    /// Scanner over the configured compiles root and recency window.
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.paths.compiles_dir.clone(),
            config.paths.descriptor_file.clone(),
        )
        .with_recent_window(config.recent_window())
    }

    /// Only projects modified within `window` of the scan are `Ready`.
    /// `None` disables the filter.
    pub fn with_recent_window(mut self, window: Option<Duration>) -> Self {
        self.recent_window = window;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a scan. The cutoff is fixed at call time.
    pub fn scan(&self) -> Result<ScanIter, ScanError> {
        self.scan_since(None)
    }

    /// Start a scan whose cutoff reaches back at least to `since`.
    ///
    /// The engine passes the start of its previous scan, so output written
    /// while a cycle was running or the daemon was sleeping is never stale,
    /// however long the gap between scans. Has no effect when the recency
    /// filter is disabled.
    pub fn scan_since(&self, since: Option<SystemTime>) -> Result<ScanIter, ScanError> {
        let unreadable = |source| ScanError::RootUnreadable {
            path: self.root.clone(),
            source,
        };
        let root = std::fs::canonicalize(&self.root).map_err(unreadable)?;
        let entries = std::fs::read_dir(&root).map_err(unreadable)?;

        let cutoff = self
            .recent_window
            .and_then(|w| SystemTime::now().checked_sub(w))
            .map(|window_start| match since {
                Some(previous) => window_start.min(previous),
                None => window_start,
            });
        debug!(root = %root.display(), ?cutoff, "scanning compiles root");

        Ok(ScanIter {
            entries,
            descriptor_file: self.descriptor_file.clone(),
            cutoff,
        })
    }

    /// Convenience: consume a whole scan.
    pub fn scan_all(&self) -> Result<Vec<ScanEntry>, ScanError> {
        Ok(self.scan()?.collect())
    }
}

/// Lazy iterator over the root's linked projects.
pub struct ScanIter {
    entries: ReadDir,
    descriptor_file: String,
    cutoff: Option<SystemTime>,
}

impl Iterator for ScanIter {
    type Item = ScanEntry;

    fn next(&mut self) -> Option<ScanEntry> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "unreadable entry in compiles root");
                    continue;
                }
            };
            let path = entry.path();
            // Follows symlinks so a linked project directory still counts.
            if !path.is_dir() {
                continue;
            }

            let descriptor = match descriptor::read(&path, &self.descriptor_file) {
                Ok(Some(d)) => d,
                Ok(None) => continue,
                Err(e) => {
                    warn!(project = %path.display(), error = %e, "skipping project with bad link descriptor");
                    return Some(ScanEntry::Malformed {
                        path,
                        reason: e.to_string(),
                    });
                }
            };

            let folder_name = entry.file_name().to_string_lossy().into_owned();
            let compiled_at = latest_mtime(&path);
            let project = Project {
                path,
                folder_name,
                compiled_at,
                descriptor,
            };

            return match self.cutoff {
                Some(cutoff) if project.compiled_at < cutoff => {
                    debug!(project = %project.folder_name, "output older than recency window");
                    Some(ScanEntry::Stale(project))
                }
                _ => Some(ScanEntry::Ready(project)),
            };
        }
    }
}

/// Most recent modification time in the tree rooted at `dir`, ignoring
/// `.git` metadata. Unreadable entries are skipped.
pub fn latest_mtime(dir: &Path) -> SystemTime {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
        .filter_map(Result::ok)
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;

    fn make_project(root: &Path, name: &str, descriptor: Option<&str>) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.tex"), "x").unwrap();
        if let Some(d) = descriptor {
            std::fs::write(dir.join(".gitinfo"), d).unwrap();
        }
        dir
    }

    fn age_tree(dir: &Path, secs_ago: i64) {
        let now = FileTime::now();
        let old = FileTime::from_unix_time(now.unix_seconds() - secs_ago, 0);
        for entry in WalkDir::new(dir) {
            let entry = entry.unwrap();
            filetime::set_file_mtime(entry.path(), old).unwrap();
        }
    }

    fn ready_names(entries: &[ScanEntry]) -> Vec<String> {
        let mut names: Vec<String> = entries
            .iter()
            .filter_map(|e| match e {
                ScanEntry::Ready(p) => Some(p.folder_name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_unlinked_directories_are_silent() {
        let root = tempfile::tempdir().unwrap();
        make_project(root.path(), "plain", None);
        std::fs::write(root.path().join("stray.txt"), "file at root").unwrap();

        let entries = Scanner::new(root.path(), ".gitinfo").scan_all().unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_linked_and_malformed() {
        let root = tempfile::tempdir().unwrap();
        make_project(root.path(), "a", Some(r#"{"gitrepo": "https://example.com/u/a"}"#));
        make_project(root.path(), "b", Some("{ not json"));
        make_project(root.path(), "c", None);

        let entries = Scanner::new(root.path(), ".gitinfo").scan_all().unwrap();
        assert_eq!(ready_names(&entries), vec!["a"]);
        let malformed: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e, ScanEntry::Malformed { .. }))
            .collect();
        assert_eq!(malformed.len(), 1);
        if let ScanEntry::Malformed { path, .. } = malformed[0] {
            assert!(path.ends_with("b"));
        }
    }

    #[test]
    fn test_project_path_is_absolute() {
        let root = tempfile::tempdir().unwrap();
        make_project(root.path(), "a", Some(r#"{"gitrepo": "/srv/a.git"}"#));
        let entries = Scanner::new(root.path(), ".gitinfo").scan_all().unwrap();
        match &entries[0] {
            ScanEntry::Ready(p) => {
                assert!(p.path.is_absolute());
                assert_eq!(p.descriptor.repo_url, "/srv/a.git");
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_recency_window() {
        let root = tempfile::tempdir().unwrap();
        make_project(root.path(), "fresh", Some(r#"{"gitrepo": "/r/fresh"}"#));
        let old = make_project(root.path(), "old", Some(r#"{"gitrepo": "/r/old"}"#));
        age_tree(&old, 3600);

        let scanner =
            Scanner::new(root.path(), ".gitinfo").with_recent_window(Some(Duration::from_secs(300)));
        let entries = scanner.scan_all().unwrap();
        assert_eq!(ready_names(&entries), vec!["fresh"]);
        assert!(entries
            .iter()
            .any(|e| matches!(e, ScanEntry::Stale(p) if p.folder_name == "old")));

        // Recompiling one file brings the project back.
        std::fs::write(old.join("main.tex"), "y").unwrap();
        let entries = scanner.scan_all().unwrap();
        assert_eq!(ready_names(&entries), vec!["fresh", "old"]);
    }

    #[test]
    fn test_cutoff_reaches_back_to_previous_scan() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_project(root.path(), "slow", Some(r#"{"gitrepo": "/r/slow"}"#));
        age_tree(&dir, 600);
        let scanner =
            Scanner::new(root.path(), ".gitinfo").with_recent_window(Some(Duration::from_secs(60)));

        let previous = SystemTime::now() - Duration::from_secs(900);
        let entries: Vec<_> = scanner.scan_since(Some(previous)).unwrap().collect();
        assert_eq!(ready_names(&entries), vec!["slow"]);

        // A later anchor never shortens the window.
        let recent = SystemTime::now() - Duration::from_secs(10);
        let entries: Vec<_> = scanner.scan_since(Some(recent)).unwrap().collect();
        assert!(ready_names(&entries).is_empty());
    }

    #[test]
    fn test_no_window_means_everything_ready() {
        let root = tempfile::tempdir().unwrap();
        let old = make_project(root.path(), "old", Some(r#"{"gitrepo": "/r/old"}"#));
        age_tree(&old, 86_400);
        let entries = Scanner::new(root.path(), ".gitinfo").scan_all().unwrap();
        assert_eq!(ready_names(&entries), vec!["old"]);
    }

    #[test]
    fn test_fixed_descriptor_reappears() {
        let root = tempfile::tempdir().unwrap();
        let b = make_project(root.path(), "b", Some("garbage"));
        let scanner = Scanner::new(root.path(), ".gitinfo");
        assert!(ready_names(&scanner.scan_all().unwrap()).is_empty());

        std::fs::write(b.join(".gitinfo"), r#"{"gitrepo": "https://example.com/u/b"}"#).unwrap();
        assert_eq!(ready_names(&scanner.scan_all().unwrap()), vec!["b"]);
    }

    #[test]
    fn test_from_config_uses_descriptor_name() {
        let root = tempfile::tempdir().unwrap();
        let dir = make_project(root.path(), "a", None);
        std::fs::write(dir.join("link.json"), r#"{"gitrepo": "/r/a"}"#).unwrap();

        let mut config = BridgeConfig::default();
        config.paths.compiles_dir = root.path().to_path_buf();
        config.paths.descriptor_file = "link.json".into();
        let entries = Scanner::from_config(&config).scan_all().unwrap();
        assert_eq!(ready_names(&entries), vec!["a"]);
    }

    #[test]
    fn test_unreadable_root_is_fatal() {
        let result = Scanner::new("/nonexistent/compiles", ".gitinfo").scan();
        assert!(matches!(result, Err(ScanError::RootUnreadable { .. })));
    }

    #[test]
    fn test_latest_mtime_ignores_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.tex"), "a").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/index"), "i").unwrap();
        age_tree(dir.path(), 1000);
        // Touch only inside .git.
        std::fs::write(dir.path().join(".git/index"), "j").unwrap();
        filetime::set_file_mtime(
            dir.path().join(".git"),
            FileTime::from_unix_time(FileTime::now().unix_seconds() - 1000, 0),
        )
        .unwrap();

        let newest = latest_mtime(dir.path());
        let age = SystemTime::now().duration_since(newest).unwrap();
        assert!(age >= Duration::from_secs(900));
    }
}
