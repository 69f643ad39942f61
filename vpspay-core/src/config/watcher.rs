//! Chain watcher configuration.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Height to backfill from when nothing has been observed yet.
    pub start_height: i64,
    /// First resubscribe delay.
    pub backoff_base: Duration,
    /// Upper bound of the resubscribe delay.
    pub backoff_max: Duration,
    /// Blocks fetched per `getLogs` call during backfill.
    pub backfill_chunk: i64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(60),
            backfill_chunk: 2_000,
        }
    }
}
