//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const DEFAULT_RETRY_INTERVAL_MIN_MS: u64 = 10_000;
const DEFAULT_RETRY_INTERVAL_MAX_MS: u64 = 600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Initial retry interval after forwarding an update.
    pub retry_interval_min_ms: u64,
    /// Ceiling of the exponential retry backoff.
    pub retry_interval_max_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_interval_min_ms: DEFAULT_RETRY_INTERVAL_MIN_MS,
            retry_interval_max_ms: DEFAULT_RETRY_INTERVAL_MAX_MS,
        }
    }
}

impl ManagerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_interval_min_ms),
            Duration::from_millis(self.retry_interval_max_ms),
        )
    }
}
