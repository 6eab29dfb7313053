// ============================================================================
// Relay Worker Configuration
// ============================================================================

use crate::constants::*;
use std::time::Duration;

/// Staging relay loop timings
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// How long one poll waits for a record before re-checking the shutdown flag
    pub poll_timeout_ms: u64,
    /// Pause after an aborted relay transaction before the record is retried
    pub retry_backoff_ms: u64,
}

impl RelayConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            poll_timeout_ms: std::env::var("RELAY_POLL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RELAY_POLL_TIMEOUT_MS),
            retry_backoff_ms: std::env::var("RELAY_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RELAY_RETRY_BACKOFF_MS),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DEFAULT_RELAY_POLL_TIMEOUT_MS,
            retry_backoff_ms: DEFAULT_RELAY_RETRY_BACKOFF_MS,
        }
    }
}
