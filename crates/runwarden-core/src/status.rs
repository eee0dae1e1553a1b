//! Status enums for Tasks and Runs.
//!
//! Both enums are persisted as snake_case strings. Parsing is strict: an
//! unknown value is an error, never silently passed through.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, waiting to be scheduled.
    #[default]
    Todo,
    /// Task has an active run.
    Running,
    /// Agent output awaits operator review.
    Review,
    /// Task paused or waiting on something outside the system.
    Blocked,
    /// Last run failed terminally.
    Failed,
    /// Task was cancelled by an operator.
    Cancelled,
    /// Task accepted as finished.
    Done,
}

impl TaskStatus {
    /// All task statuses in declaration order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Todo,
        Self::Running,
        Self::Review,
        Self::Blocked,
        Self::Failed,
        Self::Cancelled,
        Self::Done,
    ];

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Running => "running",
            Self::Review => "review",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Done => "done",
        }
    }

    /// Returns true if no transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStatus {
                kind: "task",
                value: s.to_string(),
            })
    }
}

/// Status of a single execution attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but not yet started.
    #[default]
    Queued,
    /// Provider call in flight.
    Running,
    /// Waiting for `next_retry_at` after a retryable failure.
    RetryScheduled,
    /// Run completed successfully.
    Succeeded,
    /// Run failed and will not be retried.
    Failed,
    /// Run was cancelled.
    Cancelled,
    /// Run was cut off by a process restart or shutdown.
    Interrupted,
}

impl RunStatus {
    /// All run statuses in declaration order.
    pub const ALL: [RunStatus; 7] = [
        Self::Queued,
        Self::Running,
        Self::RetryScheduled,
        Self::Succeeded,
        Self::Failed,
        Self::Cancelled,
        Self::Interrupted,
    ];

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::UnknownStatus {
                kind: "run",
                value: s.to_string(),
            })
    }
}
