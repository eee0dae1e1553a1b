//! Orchestrator configuration.

use std::time::Duration;

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retryable failures tolerated before a run fails for good.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound for any retry delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Stuck-run detector knobs.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Time between sweeps.
    pub interval: Duration,

    /// A running run with no activity for this long raises an idle alert.
    pub idle_timeout: Duration,

    /// Number of most recent log messages inspected per run.
    pub repeat_window: usize,

    /// Duplicate ratio at or above which a repeated-action alert is raised.
    pub repeat_threshold: f64,

    /// Number of most recent terminal runs inspected per task.
    pub error_rate_window: usize,

    /// Failed fraction at or above which a high-error-rate alert is raised.
    pub error_rate_threshold: f64,

    /// Terminal runs required before the error rate is evaluated.
    pub error_rate_min_samples: usize,

    /// Maximum running runs inspected per sweep.
    pub scan_limit: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            repeat_window: 6,
            repeat_threshold: 0.7,
            error_rate_window: 10,
            error_rate_threshold: 0.5,
            error_rate_min_samples: 5,
            scan_limit: 500,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retry policy.
    pub retry: RetryConfig,

    /// Stuck-run detector.
    pub detector: DetectorConfig,

    /// Hard timeout for one provider call.
    pub default_execution_timeout: Duration,

    /// Persisted error messages are cut to this many characters.
    pub error_message_max_len: usize,

    /// Maximum runs touched per recovery step.
    pub recovery_batch_limit: usize,

    /// Time between dispatch attempts when nothing is schedulable.
    pub dispatch_interval: Duration,

    /// Time between checks for due retries.
    pub retry_poll_interval: Duration,

    /// Capacity of the in-process event broadcast channel.
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            detector: DetectorConfig::default(),
            default_execution_timeout: Duration::from_secs(120),
            error_message_max_len: 2000,
            recovery_batch_limit: 1000,
            dispatch_interval: Duration::from_secs(2),
            retry_poll_interval: Duration::from_secs(1),
            event_channel_capacity: 1024,
        }
    }
}

/// Convert a std duration into a chrono duration, saturating on overflow.
pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
