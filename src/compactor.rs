use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::{Engine, EngineError};

pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match compact_if_due(&engine, threshold).await {
            Ok(Some(appends)) => info!("compacted WAL after {appends} appends"),
            Ok(None) => {}
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}

/// Compact when the append count has reached `threshold`. Returns the count
/// that triggered it.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<Option<u64>, EngineError> {
    let appends = engine.wal_appends_since_compact().await?;
    if appends < threshold.max(1) {
        return Ok(None);
    }
    engine.compact_wal().await?;
    Ok(Some(appends))
}
