//! Retry policy: decides backoff delays.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{chrono_duration, RetryConfig};

/// Exponential backoff bounded by `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retryable failures tolerated before giving up.
    pub max_attempts: u32,

    /// Delay after the first failure.
    pub base_delay: Duration,

    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy from configuration.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Delay before retrying after the `failure_count`-th failure (1-indexed).
    ///
    /// `min(base_delay * 2^(failure_count - 1), max_delay)`.
    pub fn delay(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// When to retry after the `failure_count`-th failure, or `None` when the
    /// policy is exhausted.
    pub fn next_retry_at(&self, failure_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if failure_count > self.max_attempts {
            return None;
        }
        now.checked_add_signed(chrono_duration(self.delay(failure_count)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
