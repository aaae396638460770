//! Reconnect policy for the transport connector.
//!
//! Exponential backoff with a hard cap and a bounded number of retries.
//! After the retries are exhausted the connector gives up and leaves
//! recovery to a manual or focus-triggered `connect()`.

/// Reconnect policy implementing capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of retries before giving up.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap for the exponential growth, in milliseconds.
    pub max_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before the retry with the given count.
    ///
    /// `min(initial * 2^retry_count, max)` milliseconds.
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Whether another retry is allowed at the given count.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}
