//! Mirroring compiled output into a local clone's working tree.
//!
//! The clone's tracked content is replaced wholesale: everything except
//! `.git/` and `.gitignore` is removed, the project tree is copied in, and the
//! managed ignore section is rewritten. Running this twice on the same input
//! leaves an identical tree.
//!
//! A project that ships its own root `.gitignore` owns the unmanaged rules:
//! its file is mirrored like any other and replaces the clone's, and only the
//! managed section is then re-applied. Without one, the clone's existing
//! rules are kept.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::{io_err, WorkspaceError};
use crate::file_policy::FilePolicy;
use crate::gitignore;

/// Entries in the clone root that survive the cleanup.
const PRESERVED: [&str; 2] = [".git", ".gitignore"];

/// Counters from one copy pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub dirs: usize,
    pub skipped: usize,
}

/// Stable directory name for the clone of the project at `project_path`.
///
/// The folder name keeps the directory recognisable; the hash of the full
/// path keeps two projects with the same name apart.
pub fn clone_key(project_path: &Path, folder_name: &str) -> String {
    let digest = Sha256::digest(project_path.to_string_lossy().as_bytes());
    let hash = hex::encode(digest);
    let mut name: String = folder_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    if name.is_empty() {
        name.push_str("project");
    }
    format!("{}-{}", name, &hash[..16])
}

/// Replace the clone's content with the project's and refresh the managed
/// ignore section.
pub fn replace_content(
    project_dir: &Path,
    clone_dir: &Path,
    descriptor_file: &str,
    policy: &FilePolicy,
    ignore_template: &str,
) -> Result<CopyStats, WorkspaceError> {
    clear_worktree(clone_dir)?;
    let stats = copy_project(project_dir, clone_dir, descriptor_file, policy)?;
    gitignore::write_managed_section(&clone_dir.join(".gitignore"), ignore_template)?;
    info!(
        files = stats.files,
        dirs = stats.dirs,
        skipped = stats.skipped,
        "mirrored project output into clone"
    );
    Ok(stats)
}

/// Remove every top-level entry of `clone_dir` except `.git` and `.gitignore`.
pub fn clear_worktree(clone_dir: &Path) -> Result<(), WorkspaceError> {
    let entries = std::fs::read_dir(clone_dir).map_err(|e| io_err(clone_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(clone_dir, e))?;
        let name = entry.file_name();
        if PRESERVED.iter().any(|p| name == *p) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        } else {
            std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        }
        debug!(path = %path.display(), "removed from clone");
    }
    Ok(())
}

/// Copy the project tree into `dst`.
///
/// Skips `.git` entries at any depth, the descriptor file at the root, and
/// whatever `policy` rejects.
pub fn copy_project(
    src: &Path,
    dst: &Path,
    descriptor_file: &str,
    policy: &FilePolicy,
) -> Result<CopyStats, WorkspaceError> {
    let mut stats = CopyStats::default();

    let walker = WalkDir::new(src)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name();
            if name == ".git" {
                return false;
            }
            if e.depth() == 1 && name == descriptor_file {
                return false;
            }
            if e.file_type().is_dir() {
                if let Ok(rel) = e.path().strip_prefix(src) {
                    return !policy.excludes_dir(&rel_string(rel));
                }
            }
            true
        });

    for entry in walker {
        let entry = entry?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let target = dst.join(&rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            stats.files += 1;
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let decision = policy.evaluate(&rel_string(&rel), size);
            if !decision.should_copy() {
                debug!(path = %rel.display(), decision = decision.label(), "not mirrored");
                stats.skipped += 1;
                continue;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| io_err(&target, e))?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    let link: PathBuf = std::fs::read_link(src).map_err(|e| io_err(src, e))?;
    std::os::unix::fs::symlink(&link, dst).map_err(|e| io_err(dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), WorkspaceError> {
    std::fs::copy(src, dst).map_err(|e| io_err(dst, e))?;
    Ok(())
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_clone_key_is_stable_and_distinct() {
        let a = clone_key(Path::new("/data/compiles/paper"), "paper");
        let b = clone_key(Path::new("/data/compiles/paper"), "paper");
        let c = clone_key(Path::new("/other/compiles/paper"), "paper");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("paper-"));
        assert_eq!(a.len(), "paper-".len() + 16);
    }

    #[test]
    fn test_clone_key_sanitizes_name() {
        let key = clone_key(Path::new("/c/My Thesis (v2)"), "My Thesis (v2)");
        assert!(key.starts_with("My_Thesis__v2_-"));
        assert!(!key.contains(' '));
    }

    #[test]
    fn test_clear_worktree_preserves_git_and_ignore() {
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(dst.path().join(".git")).unwrap();
        std::fs::write(dst.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();
        std::fs::write(dst.path().join(".gitignore"), "mine/\n").unwrap();
        std::fs::write(dst.path().join("old.tex"), "old").unwrap();
        std::fs::create_dir_all(dst.path().join("figs/sub")).unwrap();
        std::fs::write(dst.path().join("figs/sub/a.png"), "png").unwrap();

        clear_worktree(dst.path()).unwrap();

        assert!(dst.path().join(".git/HEAD").exists());
        assert_eq!(read(&dst.path().join(".gitignore")), "mine/\n");
        assert!(!dst.path().join("old.tex").exists());
        assert!(!dst.path().join("figs").exists());
    }

    #[test]
    fn test_copy_project_skips_metadata_and_descriptor() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join(".gitinfo"), "{}").unwrap();
        std::fs::write(src.path().join("main.tex"), "\\documentclass{article}").unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "x").unwrap();
        std::fs::create_dir_all(src.path().join("chapters/.git")).unwrap();
        std::fs::write(src.path().join("chapters/one.tex"), "one").unwrap();
        std::fs::write(src.path().join("chapters/.gitinfo"), "nested is content").unwrap();

        let stats = copy_project(src.path(), dst.path(), ".gitinfo", &FilePolicy::default()).unwrap();

        assert_eq!(read(&dst.path().join("main.tex")), "\\documentclass{article}");
        assert_eq!(read(&dst.path().join("chapters/one.tex")), "one");
        assert!(dst.path().join("chapters/.gitinfo").exists());
        assert!(!dst.path().join(".gitinfo").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join("chapters/.git").exists());
        assert_eq!(stats.files, 3);
        assert_eq!(stats.dirs, 1);
    }

    #[test]
    fn test_copy_project_applies_policy() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("main.tex"), "tex").unwrap();
        std::fs::write(src.path().join("big.pdf"), vec![0u8; 64]).unwrap();
        std::fs::create_dir(src.path().join("scratch")).unwrap();
        std::fs::write(src.path().join("scratch/x.tex"), "x").unwrap();

        let policy = FilePolicy::new(32, vec!["scratch/**".into()]);
        let stats = copy_project(src.path(), dst.path(), ".gitinfo", &policy).unwrap();

        assert!(dst.path().join("main.tex").exists());
        assert!(!dst.path().join("big.pdf").exists());
        assert!(!dst.path().join("scratch").exists());
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn test_replace_content_is_idempotent() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir(dst.path().join(".git")).unwrap();
        std::fs::write(dst.path().join("stale.tex"), "gone").unwrap();
        std::fs::write(src.path().join("main.tex"), "body").unwrap();

        let policy = FilePolicy::default();
        replace_content(src.path(), dst.path(), ".gitinfo", &policy, "*.aux\n").unwrap();
        let first = read(&dst.path().join(".gitignore"));
        replace_content(src.path(), dst.path(), ".gitinfo", &policy, "*.aux\n").unwrap();
        let second = read(&dst.path().join(".gitignore"));

        assert_eq!(first, second);
        assert!(!dst.path().join("stale.tex").exists());
        assert_eq!(read(&dst.path().join("main.tex")), "body");
        assert_eq!(gitignore::managed_content(&second), Some("*.aux\n"));
    }

    #[test]
    fn test_clone_rules_kept_without_project_gitignore() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let existing = format!("from-remote/\n{}", gitignore::managed_block("*.old\n"));
        std::fs::write(dst.path().join(".gitignore"), &existing).unwrap();
        std::fs::write(src.path().join("main.tex"), "body").unwrap();

        replace_content(src.path(), dst.path(), ".gitinfo", &FilePolicy::default(), "*.log\n")
            .unwrap();

        let text = read(&dst.path().join(".gitignore"));
        assert!(text.starts_with("from-remote/\n"));
        assert_eq!(gitignore::managed_content(&text), Some("*.log\n"));
        assert!(!text.contains("*.old"));
    }

    #[test]
    fn test_project_gitignore_replaces_clone_rules_then_gets_section() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(dst.path().join(".gitignore"), "from-remote/\n").unwrap();
        std::fs::write(src.path().join(".gitignore"), "from-project/\n").unwrap();

        replace_content(src.path(), dst.path(), ".gitinfo", &FilePolicy::default(), "*.log\n")
            .unwrap();

        let text = read(&dst.path().join(".gitignore"));
        assert!(text.starts_with("from-project/\n"));
        assert!(!text.contains("from-remote"));
        assert_eq!(gitignore::managed_content(&text), Some("*.log\n"));
    }
}
