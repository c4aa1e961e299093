use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the WAL once more than `threshold` records were appended since the last rewrite.
///
/// Returns the number of events written, or `None` if nothing was due.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Option<usize> {
    let appended = engine.wal_appends_since_compact().await;
    if appended < threshold {
        debug!(appended, threshold, "compaction not due");
        return None;
    }
    match engine.compact_wal().await {
        Ok(events) => {
            info!(appended, events, "WAL compacted");
            Some(events)
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            None
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}
