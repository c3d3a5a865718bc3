use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::engine::Engine;

/// How often the compactor checks the WAL growth.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that checks out stays whose check-out date has passed.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One sweep pass. Failures are logged; the next tick retries.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = engine.now();
    match engine.auto_check_out_expired_bookings(now).await {
        Ok(moved) if moved.is_empty() => {
            debug!("sweep: nothing expired");
            0
        }
        Ok(moved) => {
            info!(count = moved.len(), "sweep: checked out expired bookings");
            moved.len()
        }
        Err(e) => {
            error!("sweep failed: {e}");
            0
        }
    }
}

/// Background task that rewrites the WAL once enough frames piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(frames = appended, "compacted WAL");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
