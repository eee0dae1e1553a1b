//! Operator-facing alerts raised by the stuck-run detector.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AlertId, ProjectId, RunId, TaskId};

/// Condition an alert reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Running run with no activity for longer than the idle threshold.
    RunIdleTimeout,
    /// Running run repeating the same log messages.
    RunRepeatedAction,
    /// Task whose recent runs mostly failed.
    TaskHighErrorRate,
}

impl AlertKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunIdleTimeout => "RUN_IDLE_TIMEOUT",
            Self::RunRepeatedAction => "RUN_REPEATED_ACTION",
            Self::TaskHighErrorRate => "TASK_HIGH_ERROR_RATE",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconstructible de-duplication key for an alert condition.
///
/// The same condition always maps to the same source id, so at most one open
/// alert exists per condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertSourceId(String);

impl AlertSourceId {
    pub fn idle_timeout(run_id: &RunId) -> Self {
        Self(format!("run_idle_timeout:{run_id}"))
    }

    pub fn repeated_action(run_id: &RunId) -> Self {
        Self(format!("run_repeated_action:{run_id}"))
    }

    pub fn high_error_rate(task_id: &TaskId) -> Self {
        Self(format!("task_high_error_rate:{task_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlertSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Alert lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Resolved,
}

/// An inbox item for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub project_id: ProjectId,
    pub kind: AlertKind,
    pub source_id: AlertSourceId,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub title: String,
    pub body: String,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Create an open alert.
    pub fn open(
        project_id: ProjectId,
        kind: AlertKind,
        source_id: AlertSourceId,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AlertId::generate(),
            project_id,
            kind,
            source_id,
            run_id: None,
            task_id: None,
            title: title.into(),
            body: body.into(),
            status: AlertStatus::Open,
            created_at,
            resolved_at: None,
        }
    }

    /// Builder method to attach the run.
    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Builder method to attach the task.
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == AlertStatus::Open
    }
}
