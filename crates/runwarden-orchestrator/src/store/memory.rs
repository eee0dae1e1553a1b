//! In-memory store.
//!
//! Each table group sits behind its own `RwLock`. No method holds more than
//! one lock at a time and no lock is held across an `.await` on anything else,
//! so conditional updates are the only coordination between writers.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use runwarden_core::{
    Alert, AlertId, AlertSourceId, AlertStatus, EventRecord, ProjectId, RunId, RunLog,
    RunStatus, RunTransition, Task, TaskDependency, TaskId, TaskRun,
};

use super::{check_version, Store, StoreError};

#[derive(Default)]
struct TaskTables {
    tasks: HashMap<TaskId, Task>,
    dependencies: HashSet<TaskDependency>,
}

#[derive(Default)]
struct RunTables {
    runs: HashMap<RunId, TaskRun>,
    by_key: HashMap<String, RunId>,
    transitions: HashMap<RunId, Vec<RunTransition>>,
    logs: HashMap<RunId, Vec<RunLog>>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<TaskTables>,
    runs: RwLock<RunTables>,
    events: RwLock<Vec<EventRecord>>,
    alerts: RwLock<HashMap<AlertId, Alert>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored tasks.
    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.tasks.len()
    }

    /// Get the number of stored runs.
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.runs.len()
    }
}

fn terminal_order_key(run: &TaskRun) -> DateTime<Utc> {
    run.ended_at.unwrap_or(run.updated_at)
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_task(&self, task: Task) -> Result<Task, StoreError> {
        let mut tables = self.tasks.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(StoreError::Constraint(format!(
                "task {} already exists",
                task.id
            )));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(&self, project_id: &ProjectId) -> Result<Vec<Task>, StoreError> {
        let tables = self.tasks.read().await;
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|t| &t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn update_task(&self, mut task: Task, expected_version: u64) -> Result<Task, StoreError> {
        let mut tables = self.tasks.write().await;
        let stored = tables
            .tasks
            .get_mut(&task.id)
            .ok_or_else(|| StoreError::task_not_found(&task.id))?;
        check_version("task", task.id.as_str(), expected_version, stored.version)?;

        task.version = expected_version + 1;
        *stored = task.clone();
        Ok(task)
    }

    async fn delete_task(&self, id: &TaskId, expected_version: u64) -> Result<Task, StoreError> {
        let mut tables = self.tasks.write().await;
        let stored = tables
            .tasks
            .get(id)
            .ok_or_else(|| StoreError::task_not_found(id))?;
        check_version("task", id.as_str(), expected_version, stored.version)?;

        tables.dependencies.retain(|d| &d.task_id != id);
        tables
            .tasks
            .remove(id)
            .ok_or_else(|| StoreError::task_not_found(id))
    }

    async fn list_children(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        let tables = self.tasks.read().await;
        let mut children: Vec<TaskId> = tables
            .tasks
            .values()
            .filter(|t| t.parent_task_id.as_ref() == Some(id))
            .map(|t| t.id.clone())
            .collect();
        children.sort();
        Ok(children)
    }

    async fn insert_dependency(&self, dependency: TaskDependency) -> Result<(), StoreError> {
        let mut tables = self.tasks.write().await;
        for id in [&dependency.task_id, &dependency.depends_on] {
            if !tables.tasks.contains_key(id) {
                return Err(StoreError::task_not_found(id));
            }
        }
        if !tables.dependencies.insert(dependency.clone()) {
            return Err(StoreError::Constraint(format!(
                "dependency {} -> {} already exists",
                dependency.task_id, dependency.depends_on
            )));
        }
        Ok(())
    }

    async fn list_dependencies(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        let tables = self.tasks.read().await;
        let mut deps: Vec<TaskId> = tables
            .dependencies
            .iter()
            .filter(|d| &d.task_id == id)
            .map(|d| d.depends_on.clone())
            .collect();
        deps.sort();
        Ok(deps)
    }

    async fn list_dependents(&self, id: &TaskId) -> Result<Vec<TaskId>, StoreError> {
        let tables = self.tasks.read().await;
        let mut dependents: Vec<TaskId> = tables
            .dependencies
            .iter()
            .filter(|d| &d.depends_on == id)
            .map(|d| d.task_id.clone())
            .collect();
        dependents.sort();
        Ok(dependents)
    }

    async fn insert_run(&self, run: TaskRun) -> Result<TaskRun, StoreError> {
        let mut tables = self.runs.write().await;
        if tables.by_key.contains_key(&run.idempotency_key) {
            return Err(StoreError::DuplicateIdempotencyKey(
                run.idempotency_key.clone(),
            ));
        }
        if tables.runs.contains_key(&run.id) {
            return Err(StoreError::Constraint(format!("run {} already exists", run.id)));
        }
        // Attempts only grow per task.
        if tables
            .runs
            .values()
            .any(|r| r.task_id == run.task_id && r.attempt >= run.attempt)
        {
            return Err(StoreError::Constraint(format!(
                "task {} already has attempt {} or later",
                run.task_id, run.attempt
            )));
        }
        tables
            .by_key
            .insert(run.idempotency_key.clone(), run.id.clone());
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<TaskRun>, StoreError> {
        Ok(self.runs.read().await.runs.get(id).cloned())
    }

    async fn get_run_by_key(&self, idempotency_key: &str) -> Result<Option<TaskRun>, StoreError> {
        let tables = self.runs.read().await;
        Ok(tables
            .by_key
            .get(idempotency_key)
            .and_then(|id| tables.runs.get(id))
            .cloned())
    }

    async fn max_attempt(&self, task_id: &TaskId) -> Result<u32, StoreError> {
        let tables = self.runs.read().await;
        Ok(tables
            .runs
            .values()
            .filter(|r| &r.task_id == task_id)
            .map(|r| r.attempt)
            .max()
            .unwrap_or(0))
    }

    async fn update_run(
        &self,
        mut run: TaskRun,
        expected_version: u64,
        actor: &str,
    ) -> Result<TaskRun, StoreError> {
        let mut tables = self.runs.write().await;
        let stored = tables
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::run_not_found(&run.id))?;
        check_version("run", run.id.as_str(), expected_version, stored.version)?;
        if stored.idempotency_key != run.idempotency_key || stored.task_id != run.task_id {
            return Err(StoreError::Constraint(format!(
                "run {} idempotency_key and task_id are immutable",
                run.id
            )));
        }

        let previous = stored.status;
        run.version = expected_version + 1;
        *stored = run.clone();

        if previous != run.status {
            tables
                .transitions
                .entry(run.id.clone())
                .or_default()
                .push(RunTransition {
                    run_id: run.id.clone(),
                    from: previous,
                    to: run.status,
                    actor: actor.to_string(),
                    error_code: run.error_code.clone(),
                    at: run.updated_at,
                });
        }
        Ok(run)
    }

    async fn list_runs_by_status(
        &self,
        status: RunStatus,
        limit: usize,
    ) -> Result<Vec<TaskRun>, StoreError> {
        let tables = self.runs.read().await;
        let mut runs: Vec<TaskRun> = tables
            .runs
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_due_retries(
        &self,
        due_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRun>, StoreError> {
        let tables = self.runs.read().await;
        let mut runs: Vec<TaskRun> = tables
            .runs
            .values()
            .filter(|r| r.status == RunStatus::RetryScheduled)
            .filter(|r| r.next_retry_at.is_some_and(|at| at <= due_before))
            .cloned()
            .collect();
        runs.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_runs_for_task(&self, task_id: &TaskId) -> Result<Vec<TaskRun>, StoreError> {
        let tables = self.runs.read().await;
        let mut runs: Vec<TaskRun> = tables
            .runs
            .values()
            .filter(|r| &r.task_id == task_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.attempt.cmp(&a.attempt));
        Ok(runs)
    }

    async fn recent_terminal_runs(
        &self,
        window: usize,
    ) -> Result<Vec<(TaskId, Vec<TaskRun>)>, StoreError> {
        let tables = self.runs.read().await;
        let mut by_task: BTreeMap<TaskId, Vec<TaskRun>> = BTreeMap::new();
        for run in tables.runs.values().filter(|r| r.status.is_terminal()) {
            by_task.entry(run.task_id.clone()).or_default().push(run.clone());
        }
        Ok(by_task
            .into_iter()
            .map(|(task_id, mut runs)| {
                runs.sort_by(|a, b| {
                    terminal_order_key(b)
                        .cmp(&terminal_order_key(a))
                        .then_with(|| b.attempt.cmp(&a.attempt))
                });
                runs.truncate(window);
                (task_id, runs)
            })
            .collect())
    }

    async fn list_run_transitions(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<RunTransition>, StoreError> {
        Ok(self
            .runs
            .read()
            .await
            .transitions
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_run_log(&self, log: RunLog) -> Result<(), StoreError> {
        let mut tables = self.runs.write().await;
        if !tables.runs.contains_key(&log.run_id) {
            return Err(StoreError::run_not_found(&log.run_id));
        }
        tables.logs.entry(log.run_id.clone()).or_default().push(log);
        Ok(())
    }

    async fn recent_run_logs(
        &self,
        run_id: &RunId,
        limit: usize,
    ) -> Result<Vec<RunLog>, StoreError> {
        let tables = self.runs.read().await;
        let logs = tables.logs.get(run_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = logs.len().saturating_sub(limit);
        Ok(logs[start..].to_vec())
    }

    async fn append_event(&self, event: EventRecord) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn list_events(&self, project_id: &ProjectId) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| &e.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn insert_alert(&self, alert: Alert) -> Result<Alert, StoreError> {
        let mut alerts = self.alerts.write().await;
        if alerts
            .values()
            .any(|a| a.is_open() && a.source_id == alert.source_id)
        {
            return Err(StoreError::DuplicateAlert(alert.source_id.to_string()));
        }
        alerts.insert(alert.id.clone(), alert.clone());
        Ok(alert)
    }

    async fn find_open_alert(
        &self,
        source_id: &AlertSourceId,
    ) -> Result<Option<Alert>, StoreError> {
        Ok(self
            .alerts
            .read()
            .await
            .values()
            .find(|a| a.is_open() && &a.source_id == source_id)
            .cloned())
    }

    async fn list_open_alerts(&self) -> Result<Vec<Alert>, StoreError> {
        let mut open: Vec<Alert> = self
            .alerts
            .read()
            .await
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(open)
    }

    async fn resolve_alert(
        &self,
        id: &AlertId,
        at: DateTime<Utc>,
    ) -> Result<Option<Alert>, StoreError> {
        let mut alerts = self.alerts.write().await;
        match alerts.get_mut(id) {
            Some(alert) if alert.is_open() => {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(at);
                Ok(Some(alert.clone()))
            }
            _ => Ok(None),
        }
    }
}
