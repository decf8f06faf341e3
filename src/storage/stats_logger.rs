use std::time::Duration;
use tokio::time::interval;
use tracing::warn;

use super::kv_store::StorageHandler;

pub async fn start_stats_logger(storage: StorageHandler, every: Duration) {
    let mut ticker = interval(every);

    loop {
        ticker.tick().await;

        if let Err(e) = storage.log_perf_snapshot() {
            warn!("failed to log storage stats: {e}");
        }
    }
}
