//! Network timeouts against a remote that accepts connections and never
//! answers.
//!
//! Kept in its own test binary: libgit2's transport timeouts are
//! process-wide, and this test needs a short one.

use std::net::TcpListener;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime};

use gitbridge_core::config::BridgeConfig;
use gitbridge_core::credentials::CredentialProvider;
use gitbridge_core::descriptor::LinkDescriptor;
use gitbridge_core::models::{Project, SyncFailure, SyncOutcome};
use gitbridge_core::scanner::Scanner;
use gitbridge_core::sync_engine::SyncEngine;
use gitbridge_core::synchronizer::RepositorySynchronizer;

/// Accept every connection and hold it open without sending a byte.
fn silent_remote() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    format!("http://127.0.0.1:{port}/owner/paper")
}

fn project(dir: &Path, url: String) -> Project {
    Project {
        path: dir.to_path_buf(),
        folder_name: "paper".into(),
        compiled_at: SystemTime::now(),
        descriptor: LinkDescriptor { repo_url: url },
    }
}

#[test]
fn test_silent_remote_fails_within_git_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let project_dir = tmp.path().join("paper");
    std::fs::create_dir(&project_dir).unwrap();
    std::fs::write(project_dir.join("main.tex"), "x").unwrap();

    let mut config = BridgeConfig::default();
    config.paths.clones_dir = tmp.path().join("clones");
    config.git.timeout_secs = 1;
    let sync =
        RepositorySynchronizer::new(&config, CredentialProvider::new("tok").unwrap()).unwrap();
    let project = project(&project_dir, silent_remote());
    let clone_dir = sync.clone_dir(&project);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(sync.sync(&project));
    });

    let outcome = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("sync kept waiting on a silent remote");
    assert!(
        matches!(
            outcome,
            SyncOutcome::Failed {
                failure: SyncFailure::Transport { .. }
            }
        ),
        "unexpected outcome {outcome:?}"
    );
    assert!(!clone_dir.exists());
}

#[tokio::test]
async fn test_abandoned_attempt_is_reported_and_keeps_its_lock() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("compiles");
    let project_dir = root.join("paper");
    std::fs::create_dir_all(&project_dir).unwrap();
    std::fs::write(project_dir.join("main.tex"), "x").unwrap();
    std::fs::write(
        project_dir.join(".gitinfo"),
        format!(r#"{{"gitrepo": "{}"}}"#, silent_remote()),
    )
    .unwrap();

    let mut config = BridgeConfig::default();
    config.paths.clones_dir = tmp.path().join("clones");
    config.git.timeout_secs = 1;
    let sync =
        RepositorySynchronizer::new(&config, CredentialProvider::new("tok").unwrap()).unwrap();
    let engine = SyncEngine::from_parts(
        Scanner::new(&root, ".gitinfo"),
        sync,
        Duration::from_millis(100),
    );

    let report = engine.run_cycle(|| false).await.unwrap();
    match &report.projects[0].outcome {
        SyncOutcome::Failed {
            failure: SyncFailure::Transport { cause },
        } => assert!(cause.contains("may still complete"), "cause: {cause}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(engine.locks().held(), 1);

    // The blocking attempt gives up on its own once the transport times out.
    assert!(engine.wait_idle(Duration::from_secs(20)).await);
}
