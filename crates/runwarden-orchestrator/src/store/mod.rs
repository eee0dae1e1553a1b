//! Persistence boundary.
//!
//! Every mutation of a task or run row is a compare-and-swap on `version`:
//! the caller passes the version it read, the store applies the write only if
//! the row still carries that version, and bumps it by exactly one. A mismatch
//! is reported as [`StoreError::Conflict`] and nothing is written. The store
//! never retries on its own; callers re-read and decide.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use runwarden_core::{
    Alert, AlertId, AlertSourceId, EventRecord, ProjectId, RunId, RunLog, RunStatus,
    RunTransition, Task, TaskDependency, TaskId, TaskRun,
};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Version conflict on {entity} {id}: expected {expected}, found {actual}")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("Open alert already exists for {0}")]
    DuplicateAlert(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub(crate) fn task_not_found(id: &TaskId) -> Self {
        Self::NotFound {
            entity: "task",
            id: id.to_string(),
        }
    }

    pub(crate) fn run_not_found(id: &RunId) -> Self {
        Self::NotFound {
            entity: "run",
            id: id.to_string(),
        }
    }
}

/// Compare the version a caller read with the stored one.
pub(crate) fn check_version(
    entity: &'static str,
    id: &str,
    expected: u64,
    actual: u64,
) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            entity,
            id: id.to_string(),
            expected,
            actual,
        })
    }
}

/// Storage port for tasks, runs, logs, events and alerts.
///
/// Read methods return owned snapshots; no lock outlives a call.
#[async_trait]
pub trait Store: Send + Sync {
    // Tasks

    /// Insert a new task row.
    async fn insert_task(&self, task: Task) -> Result<Task, StoreError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, project_id: &ProjectId) -> Result<Vec<Task>, StoreError>;

    /// Write `task` if the stored row is still at `expected_version`.
    ///
    /// Returns the stored row with `version = expected_version + 1`.
    async fn update_task(&self, task: Task, expected_version: u64) -> Result<Task, StoreError>;

    /// Delete a task if the stored row is still at `expected_version`.
    async fn delete_task(&self, id: &TaskId, expected_version: u64) -> Result<Task, StoreError>;

    /// Tasks whose `parent_task_id` is `id`.
    async fn list_children(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError>;

    // Dependencies

    /// Insert a dependency; duplicates fail with [`StoreError::Constraint`].
    async fn insert_dependency(&self, dependency: TaskDependency) -> Result<(), StoreError>;

    /// Tasks `id` depends on.
    async fn list_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError>;

    /// Tasks that depend on `id`.
    async fn list_dependents(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError>;

    // Runs

    /// Insert a run; an existing idempotency key fails with
    /// [`StoreError::DuplicateIdempotencyKey`].
    async fn insert_run(&self, run: TaskRun) -> Result<TaskRun, StoreError>;

    async fn get_run(&self, id: &RunId) -> Result<Option<TaskRun>, StoreError>;

    async fn get_run_by_key(&self, idempotency_key: &str) -> Result<Option<TaskRun>, StoreError>;

    /// Highest attempt number recorded for the task, 0 if none.
    async fn max_attempt(&self, task_id: &TaskId) -> Result<u32, StoreError>;

    /// Write `run` if the stored row is still at `expected_version`.
    ///
    /// When the status changes, the write and its [`RunTransition`] record
    /// are applied together.
    async fn update_run(
        &self,
        run: TaskRun,
        expected_version: u64,
        actor: &str,
    ) -> Result<TaskRun, StoreError>;

    /// Runs in `status`, oldest `updated_at` first.
    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<TaskRun>, StoreError>;

    /// Retry-scheduled runs due at or before `due_before`, earliest first.
    async fn list_due_retries(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRun>, StoreError>;

    /// All runs of a task, newest attempt first.
    async fn list_runs_for_task(&self, task_id: &TaskId) -> Result<Vec<TaskRun>, StoreError>;

    /// For every task with terminal runs, its `window` most recent terminal runs.
    async fn recent_terminal_runs(
        &self,
        window: usize,
    ) -> Result<Vec<(TaskId, Vec<TaskRun>)>, StoreError>;

    /// Status history of a run, oldest first.
    async fn list_run_transitions(&self, run_id: &RunId)
        -> Result<Vec<RunTransition>, StoreError>;

    // Run logs

    async fn append_run_log(&self, log: RunLog) -> Result<(), StoreError>;

    /// The `limit` most recent log lines of a run, oldest first.
    async fn recent_run_logs(&self, run_id: &RunId, limit: usize)
        -> Result<Vec<RunLog>, StoreError>;

    // Events

    async fn append_event(&self, event: EventRecord) -> Result<(), StoreError>;

    async fn list_events(&self, project_id: &ProjectId) -> Result<Vec<EventRecord>, StoreError>;

    // Alerts

    /// Insert an open alert; an open alert with the same source id fails with
    /// [`StoreError::DuplicateAlert`].
    async fn insert_alert(&self, alert: Alert) -> Result<Alert, StoreError>;

    async fn find_open_alert(&self, source_id: &AlertSourceId)
        -> Result<Option<Alert>, StoreError>;

    async fn list_open_alerts(&self) -> Result<Vec<Alert>, StoreError>;

    /// Mark an alert resolved. Returns `None` if it was not open.
    async fn resolve_alert(
        &self,
        id: &AlertId,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError>;
}
