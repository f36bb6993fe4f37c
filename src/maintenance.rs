use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that compacts the WAL once enough appends accumulate.
/// Spawned by the embedding process; the engine itself runs no loops beyond
/// its WAL writer.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
