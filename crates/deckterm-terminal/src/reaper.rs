/// Periodic sweep that closes idle sessions
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::manager::TerminalManager;

/// Run the idle sweep every `interval` until `shutdown` is cancelled
///
/// Does nothing useful when the manager has no idle timeout, so callers may
/// skip starting it in that case.
pub fn spawn_idle_reaper(
    manager: Arc<TerminalManager>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = interval.as_secs(), "idle reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = manager.reap_idle().await;
                    debug!(reaped, "idle sweep finished");
                }
            }
        }
        debug!("idle reaper stopped");
    })
}
