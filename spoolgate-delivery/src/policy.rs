//! Retry policy for delivery attempts.

use std::time::Duration;

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

const fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

/// How often a job is attempted and how long to wait in between.
///
/// Attempts are counted from 1. After a failed attempt `n` the worker waits
/// `min(max_delay, 2^n * base_delay)` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// A policy with the default delays and at least one attempt.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Whether another attempt follows a failed attempt number `attempt`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
