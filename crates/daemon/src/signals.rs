//! Graceful shutdown signal handling for the gitbridge daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

/// Shared shutdown flag checked by the scheduler loop and the cycle engine.
pub type ShutdownFlag = Arc<AtomicBool>;

/// Create a new shutdown flag and register OS signal handlers.
///
/// On SIGTERM or SIGINT (Ctrl+C), the flag is set to `true`. The project
/// being synced when the signal arrives is allowed to finish.
pub fn setup_signal_handlers() -> ShutdownFlag {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_clone = flag.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        flag_clone.store(true, Ordering::SeqCst);
    });

    flag
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler, listening for Ctrl+C only");
            match ctrl_c.await {
                Ok(()) => info!("received SIGINT (Ctrl+C), initiating shutdown"),
                Err(e) => {
                    warn!(error = %e, "failed to listen for Ctrl+C");
                    std::future::pending::<()>().await;
                }
            }
            return;
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, initiating shutdown"),
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

/// Check whether the shutdown flag has been set.
pub fn is_shutdown_requested(flag: &ShutdownFlag) -> bool {
    flag.load(Ordering::SeqCst)
}
