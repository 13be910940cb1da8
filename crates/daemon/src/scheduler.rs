//! Polling scheduler for the gitbridge daemon.

use std::time::Duration;

use tracing::{error, info};

use gitbridge_core::sync_engine::SyncEngine;

use crate::signals::{is_shutdown_requested, ShutdownFlag};

/// Run sync cycles until shutdown is requested.
///
/// The interval is measured from the end of one cycle to the start of the
/// next. A failed cycle (unreadable compiles root) is logged and retried on
/// the next tick. Returns the number of cycles run.
pub async fn run_polling_loop(
    engine: &SyncEngine,
    poll_interval: Duration,
    shutdown: ShutdownFlag,
) -> u64 {
    info!(
        interval_secs = poll_interval.as_secs(),
        "starting polling loop"
    );
    let mut cycles = 0;

    loop {
        if is_shutdown_requested(&shutdown) {
            info!("shutdown requested, exiting polling loop");
            break;
        }

        cycles += 1;
        match engine.run_cycle(|| is_shutdown_requested(&shutdown)).await {
            Ok(report) => {
                if report.failures() > 0 {
                    info!(
                        failed = report.failures(),
                        "cycle finished with failed projects, they are retried next cycle"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "sync cycle failed");
            }
        }

        // Sleep with early exit on shutdown
        let sleep_step = Duration::from_secs(1);
        let mut slept = Duration::ZERO;
        while slept < poll_interval {
            if is_shutdown_requested(&shutdown) {
                info!("shutdown requested during sleep, exiting");
                return cycles;
            }
            let step = sleep_step.min(poll_interval - slept);
            tokio::time::sleep(step).await;
            slept += step;
        }
    }

    cycles
}
