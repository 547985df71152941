//! Periodic health sampling.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::dispatch::DispatchStats;

/// Log dispatch counters every `interval` until `stop` fires.
pub async fn run_monitor(
    interval: Duration,
    tracker: TaskTracker,
    stats: Arc<DispatchStats>,
    stop: CancellationToken,
) {
    info!(interval_secs = interval.as_secs(), "Starting monitor");

    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let snapshot = stats.snapshot();
                info!(
                    tracked_tasks = tracker.len(),
                    accepted = snapshot.accepted,
                    untracked = snapshot.untracked,
                    completed = snapshot.completed,
                    failed = snapshot.failed,
                    force_closed = snapshot.force_closed,
                    "Sensor status"
                );
            }
            _ = stop.cancelled() => {
                debug!("Monitor shutting down");
                break;
            }
        }
    }
}
