use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::authz::Actor;
use crate::engine::{now_ms, Engine};
use crate::model::Ms;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Like `interval`, but the first tick is one period out instead of immediate.
fn delayed_interval() -> tokio::time::Interval {
    tokio::time::interval_at(tokio::time::Instant::now() + SWEEP_INTERVAL, SWEEP_INTERVAL)
}

/// Delete every unbooked window that ended at or before `now`.
/// Returns how many were removed.
pub async fn sweep_expired(engine: &Engine, now: Ms) -> usize {
    let system = Actor::system();
    let mut removed = 0;
    for window_id in engine.collect_expired_windows(now).await {
        match engine.delete_availability(&system, window_id).await {
            Ok(_) => removed += 1,
            Err(e) => {
                // Booked or deleted since it was collected.
                tracing::debug!("reaper skip {window_id}: {e}");
            }
        }
    }
    removed
}

/// Background task that periodically removes ended, unbooked windows.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = delayed_interval();
    loop {
        interval.tick().await;
        let removed = sweep_expired(&engine, now_ms()).await;
        if removed > 0 {
            info!(removed, "reaped ended availability windows");
            metrics::counter!(crate::observability::WINDOWS_REAPED_TOTAL).increment(removed as u64);
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = delayed_interval();
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
