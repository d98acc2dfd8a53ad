//! Failure detection and retention sweeps
//!
//! Scans the registry once per heartbeat period: workers missing three
//! heartbeats go `Unreachable` and their in-flight builds re-enter the
//! retry policy; long-unreachable workers leave the registry; terminal
//! records past the retention window are evicted.

use std::sync::Arc;

use tracing::debug;

use protocol::Shutdown;

use crate::state::Coordinator;

/// Run periodic sweeps until shutdown.
pub fn spawn_reaper(coordinator: Arc<Coordinator>, shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = coordinator.config().heartbeat_period();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let failed_over = coordinator.reap();
                    if failed_over > 0 {
                        debug!(failed_over, "reaper requeued builds from unreachable workers");
                    }
                }
                _ = shutdown.wait() => {
                    debug!("reaper stopping");
                    return;
                }
            }
        }
    })
}
