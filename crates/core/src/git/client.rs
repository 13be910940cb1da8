//! Local Git repository operations via `git2`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use git2::{
    AutotagOption, Commit, ErrorCode, FetchOptions, FetchPrune, IndexAddOption, Oid, PushOptions,
    RemoteCallbacks, Repository, ResetType, Signature,
};
use tracing::{debug, info, instrument, warn};

use crate::credentials::{AuthenticatedUrl, CredentialProvider};
use crate::errors::GitError;

/// Name of the remote every local clone tracks.
pub const ORIGIN: &str = "origin";

/// libgit2 re-asks for credentials after each rejection; give up after this
/// many so a revoked token fails instead of looping.
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Wall-clock budget for one network operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        debug!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone `url` into `path`, authenticating through the callback.
    #[instrument(skip(creds, deadline), fields(path = %path.display()))]
    pub fn clone_repo(
        url: &str,
        path: &Path,
        creds: &CredentialProvider,
        deadline: Deadline,
    ) -> Result<Self, GitError> {
        info!("cloning git repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(network_callbacks(creds, deadline));
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        let repo = builder
            .clone(url, path)
            .map_err(|e| network_error(e, deadline, "clone"))?;
        info!("clone completed");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// URL configured for `origin`, if the remote exists.
    pub fn origin_url(&self) -> Result<Option<String>, GitError> {
        match self.repo.find_remote(ORIGIN) {
            Ok(remote) => Ok(remote.url().map(str::to_string)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point `origin` at `url`, creating the remote when missing.
    #[instrument(skip(self))]
    pub fn set_origin_url(&self, url: &str) -> Result<(), GitError> {
        if self.origin_url()?.is_some() {
            self.repo.remote_set_url(ORIGIN, url)?;
        } else {
            self.repo.remote(ORIGIN, url)?;
        }
        info!("origin reconfigured");
        Ok(())
    }

    /// Fetch `origin`, pruning remote-tracking refs that vanished upstream.
    #[instrument(skip(self, creds, deadline))]
    pub fn fetch(&self, creds: &CredentialProvider, deadline: Deadline) -> Result<(), GitError> {
        let mut remote = self.repo.find_remote(ORIGIN)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts
            .remote_callbacks(network_callbacks(creds, deadline))
            .prune(FetchPrune::On)
            .download_tags(AutotagOption::None);
        remote
            .fetch(&[] as &[&str], Some(&mut fetch_opts), None)
            .map_err(|e| network_error(e, deadline, "fetch"))?;
        debug!("fetch completed");
        Ok(())
    }

    /// Name of the branch HEAD points at. Works on an unborn HEAD.
    pub fn current_branch(&self) -> Result<String, GitError> {
        let head = self.repo.find_reference("HEAD")?;
        let target = head
            .symbolic_target()
            .ok_or_else(|| GitError::RefNotFound("HEAD is detached".into()))?;
        target
            .strip_prefix("refs/heads/")
            .map(str::to_string)
            .ok_or_else(|| GitError::RefNotFound(format!("HEAD points outside refs/heads: {target}")))
    }

    /// Commit HEAD resolves to, or `None` on an unborn branch.
    pub fn head_commit(&self) -> Result<Option<Oid>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id())),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Tree of the HEAD commit, or `None` on an unborn branch.
    pub fn head_tree(&self) -> Result<Option<Oid>, GitError> {
        match self.head_commit()? {
            Some(oid) => Ok(Some(self.repo.find_commit(oid)?.tree_id())),
            None => Ok(None),
        }
    }

    /// Remote-tracking tip for `branch`, if `origin` has it.
    pub fn upstream(&self, branch: &str) -> Result<Option<Oid>, GitError> {
        let name = tracking_ref(branch);
        match self.repo.find_reference(&name) {
            Ok(r) => Ok(r.resolve()?.target()),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether `ancestor` is reachable from `commit` (or equal to it).
    pub fn contains(&self, commit: Oid, ancestor: Oid) -> Result<bool, GitError> {
        if commit == ancestor {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(commit, ancestor)?)
    }

    /// Stage the whole working tree, deletions included, and write the
    /// resulting tree object.
    #[instrument(skip(self))]
    pub fn stage_all(&self) -> Result<Oid, GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree = index.write_tree()?;
        debug!(tree = %tree, entries = index.len(), "staged working tree");
        Ok(tree)
    }

    /// Commit `tree` on top of HEAD (or as a root commit) and advance the
    /// checked-out branch.
    #[instrument(skip(self, message))]
    pub fn commit_tree(
        &self,
        tree: Oid,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Oid, GitError> {
        let tree = self.repo.find_tree(tree)?;
        let signature = Signature::now(author_name, author_email)?;
        let parent_commit = match self.head_commit()? {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };
        let parents: Vec<&Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid)
    }

    /// Push `branch` to the remote behind `remote_url`.
    ///
    /// Runs through an in-memory remote, so the URL (and any credentials in
    /// it) never lands in the repository config.
    #[instrument(skip(self, remote_url, creds, deadline), fields(remote = %remote_url))]
    pub fn push(
        &self,
        branch: &str,
        remote_url: &AuthenticatedUrl,
        creds: &CredentialProvider,
        deadline: Deadline,
    ) -> Result<(), GitError> {
        info!("pushing");
        let mut remote = self.repo.remote_anonymous(remote_url.expose())?;
        let mut callbacks = network_callbacks(creds, deadline);
        let push_error = Arc::new(Mutex::new(None::<String>));
        let push_error_clone = Arc::clone(&push_error);
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = push_error_clone.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[refspec.as_str()], Some(&mut push_opts))
            .map_err(|e| network_error(e, deadline, "push"))?;

        let rejected = push_error.lock().ok().and_then(|mut slot| slot.take());
        if let Some(detail) = rejected {
            return Err(GitError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    /// Record a successful push in `refs/remotes/origin/<branch>`.
    pub fn update_tracking_ref(&self, branch: &str, oid: Oid) -> Result<(), GitError> {
        self.repo
            .reference(&tracking_ref(branch), oid, true, "gitbridge: push")?;
        Ok(())
    }

    /// Undo a commit that failed to reach the remote.
    ///
    /// Moves the branch back to `previous` (soft reset). With no previous
    /// commit the branch ref is deleted, leaving HEAD unborn again.
    #[instrument(skip(self))]
    pub fn rollback(&self, branch: &str, previous: Option<Oid>) -> Result<(), GitError> {
        match previous {
            Some(oid) => {
                let target = self.repo.find_object(oid, None)?;
                self.repo.reset(&target, ResetType::Soft, None)?;
            }
            None => {
                let mut reference = self.repo.find_reference(&format!("refs/heads/{branch}"))?;
                reference.delete()?;
            }
        }
        warn!("rolled back unpushed commit");
        Ok(())
    }
}

/// Apply `timeout` to libgit2's connect and socket read/write timeouts.
///
/// The progress callbacks only run while data flows, so a remote that
/// accepts the connection and then stays silent is caught here instead.
/// The setting is process-wide.
pub fn set_transport_timeouts(timeout: Duration) -> Result<(), GitError> {
    let millis = timeout.as_millis().clamp(1, i32::MAX as u128) as i32;
    // SAFETY: each call stores one integer that libgit2 reads when a
    // transport opens its socket; a concurrent reader sees either the old or
    // the new timeout.
    unsafe {
        git2::opts::set_server_connect_timeout_in_milliseconds(millis)?;
        git2::opts::set_server_timeout_in_milliseconds(millis)?;
    }
    debug!(timeout_ms = millis, "transport timeouts configured");
    Ok(())
}

fn tracking_ref(branch: &str) -> String {
    format!("refs/remotes/{ORIGIN}/{branch}")
}

/// Callbacks shared by clone, fetch and push: token credentials with a retry
/// cap, and progress hooks that abort once the deadline passes.
fn network_callbacks(creds: &CredentialProvider, deadline: Deadline) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0usize;
    callbacks.credentials(move |_url, _username, allowed| {
        if deadline.expired() {
            return Err(git2::Error::from_str("deadline exceeded"));
        }
        attempts += 1;
        if attempts > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::from_str("remote rejected the access token"));
        }
        creds.credential(allowed)
    });
    callbacks.transfer_progress(move |_progress| !deadline.expired());
    callbacks.sideband_progress(move |_data| !deadline.expired());
    callbacks
}

fn network_error(err: git2::Error, deadline: Deadline, operation: &str) -> GitError {
    if deadline.expired() {
        GitError::TimedOut {
            operation: operation.to_string(),
            secs: deadline.budget().as_secs(),
        }
    } else {
        GitError::Git2Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> CredentialProvider {
        CredentialProvider::new("test-token").unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(60))
    }

    /// Bare repository with one commit on `main`.
    fn seeded_origin(dir: &Path) -> String {
        let repo = Repository::init_bare(dir).unwrap();
        repo.set_head("refs/heads/main").unwrap();
        let blob = repo.blob(b"seed\n").unwrap();
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README.md", blob, 0o100644).unwrap();
        let tree = repo.find_tree(builder.write().unwrap()).unwrap();
        let sig = Signature::now("Seed", "seed@example.com").unwrap();
        repo.commit(Some("refs/heads/main"), &sig, &sig, "seed", &tree, &[])
            .unwrap();
        dir.to_str().unwrap().to_string()
    }

    fn origin_tip(dir: &Path) -> Oid {
        Repository::open_bare(dir)
            .unwrap()
            .refname_to_id("refs/heads/main")
            .unwrap()
    }

    fn plain(url: &str) -> AuthenticatedUrl {
        creds().authenticate(url).unwrap()
    }

    #[test]
    fn test_repo_not_found() {
        assert!(matches!(
            GitClient::new("/nonexistent"),
            Err(GitError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_clone_tracks_main() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("origin.git"));
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();

        assert_eq!(client.current_branch().unwrap(), "main");
        assert_eq!(client.origin_url().unwrap().as_deref(), Some(url.as_str()));
        let head = client.head_commit().unwrap().unwrap();
        assert_eq!(client.upstream("main").unwrap(), Some(head));
        assert!(client.repo_path().join("README.md").exists());
    }

    #[test]
    fn test_stage_commit_push_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let origin = tmp.path().join("origin.git");
        let url = seeded_origin(&origin);
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();

        let before = client.head_tree().unwrap();
        std::fs::write(client.repo_path().join("main.tex"), "body").unwrap();
        std::fs::remove_file(client.repo_path().join("README.md")).unwrap();
        let tree = client.stage_all().unwrap();
        assert_ne!(Some(tree), before);

        let staged = client.repo().find_tree(tree).unwrap();
        assert!(staged.get_name("main.tex").is_some());
        assert!(staged.get_name("README.md").is_none());

        let oid = client.commit_tree(tree, "update", "Bot", "bot@example.com").unwrap();
        client.push("main", &plain(&url), &creds(), deadline()).unwrap();
        client.update_tracking_ref("main", oid).unwrap();

        assert_eq!(origin_tip(&origin), oid);
        assert_eq!(client.upstream("main").unwrap(), Some(oid));
    }

    #[test]
    fn test_staging_unchanged_tree_matches_head() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("origin.git"));
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();
        let tree = client.stage_all().unwrap();
        assert_eq!(Some(tree), client.head_tree().unwrap());
    }

    #[test]
    fn test_anonymous_push_leaves_config_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("origin.git"));
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();
        std::fs::write(client.repo_path().join("a.tex"), "a").unwrap();
        let tree = client.stage_all().unwrap();
        client.commit_tree(tree, "a", "Bot", "bot@example.com").unwrap();
        client.push("main", &plain(&url), &creds(), deadline()).unwrap();

        let remotes = client.repo().remotes().unwrap();
        assert_eq!(remotes.len(), 1);
        let config = std::fs::read_to_string(client.repo_path().join(".git/config")).unwrap();
        assert!(!config.contains("test-token"));
    }

    #[test]
    fn test_diverged_push_is_non_fast_forward() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("origin.git"));
        let a = GitClient::clone_repo(&url, &tmp.path().join("a"), &creds(), deadline()).unwrap();
        let b = GitClient::clone_repo(&url, &tmp.path().join("b"), &creds(), deadline()).unwrap();

        std::fs::write(b.repo_path().join("b.tex"), "b").unwrap();
        let tree = b.stage_all().unwrap();
        b.commit_tree(tree, "b", "Other", "other@example.com").unwrap();
        b.push("main", &plain(&url), &creds(), deadline()).unwrap();

        std::fs::write(a.repo_path().join("a.tex"), "a").unwrap();
        let tree = a.stage_all().unwrap();
        a.commit_tree(tree, "a", "Bot", "bot@example.com").unwrap();
        let err = a.push("main", &plain(&url), &creds(), deadline()).unwrap_err();
        assert!(err.is_non_fast_forward(), "unexpected error: {err}");

        // After fetching, the divergence is visible locally.
        a.fetch(&creds(), deadline()).unwrap();
        let head = a.head_commit().unwrap().unwrap();
        let upstream = a.upstream("main").unwrap().unwrap();
        assert!(!a.contains(head, upstream).unwrap());
        assert!(b.contains(b.head_commit().unwrap().unwrap(), upstream).unwrap());
    }

    #[test]
    fn test_rollback_restores_previous_head() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("origin.git"));
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();
        let previous = client.head_commit().unwrap();

        std::fs::write(client.repo_path().join("x.tex"), "x").unwrap();
        let tree = client.stage_all().unwrap();
        client.commit_tree(tree, "x", "Bot", "bot@example.com").unwrap();
        client.rollback("main", previous).unwrap();

        assert_eq!(client.head_commit().unwrap(), previous);
    }

    #[test]
    fn test_rollback_of_root_commit_leaves_head_unborn() {
        let tmp = tempfile::tempdir().unwrap();
        Repository::init(tmp.path()).unwrap();
        let client = GitClient::new(tmp.path()).unwrap();
        let branch = client.current_branch().unwrap();
        assert_eq!(client.head_commit().unwrap(), None);

        std::fs::write(tmp.path().join("f.tex"), "f").unwrap();
        let tree = client.stage_all().unwrap();
        client.commit_tree(tree, "root", "Bot", "bot@example.com").unwrap();
        client.rollback(&branch, None).unwrap();

        assert_eq!(client.head_commit().unwrap(), None);
        assert_eq!(client.current_branch().unwrap(), branch);
    }

    #[test]
    fn test_set_origin_url_and_prune() {
        let tmp = tempfile::tempdir().unwrap();
        let url = seeded_origin(&tmp.path().join("first.git"));
        let client = GitClient::clone_repo(&url, &tmp.path().join("clone"), &creds(), deadline()).unwrap();

        let empty = tmp.path().join("second.git");
        Repository::init_bare(&empty).unwrap();
        let second = empty.to_str().unwrap();
        client.set_origin_url(second).unwrap();
        client.fetch(&creds(), deadline()).unwrap();

        assert_eq!(client.origin_url().unwrap().as_deref(), Some(second));
        assert_eq!(client.upstream("main").unwrap(), None);
        assert!(client.head_commit().unwrap().is_some());
    }

    #[test]
    fn test_expired_deadline_reports_timeout() {
        let expired = Deadline::after(Duration::ZERO);
        let err = network_error(git2::Error::from_str("aborted by callback"), expired, "fetch");
        assert!(matches!(err, GitError::TimedOut { ref operation, .. } if operation == "fetch"));

        let err = network_error(git2::Error::from_str("dns"), deadline(), "fetch");
        assert!(matches!(err, GitError::Git2Error(_)));
    }
}
