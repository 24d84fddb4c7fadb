use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_SAVE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tunables for a [`QueueStore`](crate::store::QueueStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on one save round trip when the caller supplies none.
    pub save_timeout_ms: u64,
    /// Buffered events per subscriber before slow receivers start lagging.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            save_timeout_ms: DEFAULT_SAVE_TIMEOUT_MS,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_millis(self.save_timeout_ms)
    }
}
