//! Reconnect Backoff Policy
//!
//! Linear backoff with a ceiling on both the delay and the number of
//! consecutive failed attempts:
//!
//! ```text
//! delay(retry) = min(retry * step, max_delay)      retry = 1, 2, 3, ...
//! ```
//!
//! With the defaults (200ms step, 2s ceiling, 5 retries) a socket is
//! abandoned after five consecutive failed reconnects.

use std::time::Duration;

/// Backoff policy for re-establishing a dropped pub/sub socket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay added per retry
    pub step: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            step: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `retry` (1-indexed)
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        self.step
            .checked_mul(retry)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether attempt number `retry` may still be made
    #[must_use]
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Delay before attempt `retry`, or `None` once the ceiling is hit
    #[must_use]
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        self.allows(retry).then(|| self.delay(retry))
    }
}
