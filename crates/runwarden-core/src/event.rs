//! Event records emitted on every state change and alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, ProjectId, RunId, TaskId};
use crate::{RunStatus, TaskStatus};

/// An event record observed by dashboards and stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event identifier.
    pub id: EventId,
    /// Project the event belongs to.
    pub project_id: ProjectId,
    /// Type of event.
    pub event_type: EventType,
    /// Event-specific payload.
    pub payload: serde_json::Value,
    /// Correlation id supplied by the caller.
    pub trace_id: Option<String>,
    /// When the event was emitted.
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Create a new event record.
    pub fn new(
        project_id: ProjectId,
        event_type: EventType,
        payload: serde_json::Value,
        trace_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            project_id,
            event_type,
            payload,
            trace_id,
            created_at,
        }
    }

    /// Create a `task_status_changed` event.
    pub fn task_status_changed(
        project_id: ProjectId,
        change: &TaskStatusChanged,
        trace_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            project_id,
            EventType::TaskStatusChanged,
            to_payload(change),
            trace_id,
            created_at,
        )
    }

    /// Create a `run_status_changed` event.
    pub fn run_status_changed(
        project_id: ProjectId,
        change: &RunStatusChanged,
        trace_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            project_id,
            EventType::RunStatusChanged,
            to_payload(change),
            trace_id,
            created_at,
        )
    }

    /// Decode the payload of a `task_status_changed` event.
    pub fn as_task_status_changed(&self) -> Option<TaskStatusChanged> {
        if self.event_type != EventType::TaskStatusChanged {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Decode the payload of a `run_status_changed` event.
    pub fn as_run_status_changed(&self) -> Option<RunStatusChanged> {
        if self.event_type != EventType::RunStatusChanged {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Type of event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    TaskStatusChanged,
    TaskDeleted,
    DependencyAdded,
    RunCreated,
    RunStatusChanged,
    RunResultLogged,
    AlertRaised,
    AlertResolved,
}

/// Fixed payload of `task_status_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusChanged {
    pub task_id: TaskId,
    pub previous_status: TaskStatus,
    pub new_status: TaskStatus,
    pub actor: String,
    pub version: u64,
}

/// Fixed payload of `run_status_changed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusChanged {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub previous_status: RunStatus,
    pub new_status: RunStatus,
    pub actor: String,
    pub attempt: u32,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}
