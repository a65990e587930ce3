//! Reconnect policy: exponential backoff with a bounded attempt count.

use std::time::Duration;

/// Pure backoff schedule. Attempts are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// `base * 2^(attempt - 1)`, saturating. Attempt 0 is treated as 1.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}
