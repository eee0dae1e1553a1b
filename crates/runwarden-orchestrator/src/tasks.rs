//! Task mutations under the optimistic-concurrency contract.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use runwarden_core::task::validate_priority;
use runwarden_core::task_machine::{can_transition, resolve_verb, validate_transition};
use runwarden_core::{
    CoreError, EventRecord, EventType, NewTask, Task, TaskDependency, TaskId, TaskStatus,
    TaskStatusChanged,
};

use crate::clock::Clock;
use crate::error::{OrchestratorError, Result};
use crate::events::EventSink;
use crate::store::{check_version, Store};

/// Attempts made by [`TaskService::advance`] before giving up on conflicts.
const FOLLOW_THROUGH_ATTEMPTS: usize = 3;

/// Creates, transitions and deletes tasks.
pub struct TaskService {
    store: Arc<dyn Store>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    /// Create a new TaskService.
    pub fn new(store: Arc<dyn Store>, events: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    /// Get a task by id.
    pub async fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| OrchestratorError::TaskNotFound(id.clone()))
    }

    /// Create a task in `todo`.
    pub async fn create_task(&self, input: NewTask, trace_id: Option<String>) -> Result<Task> {
        validate_priority(input.priority)?;

        if let Some(parent_id) = &input.parent_task_id {
            let parent = self.get_task(parent_id).await?;
            if parent.project_id != input.project_id {
                return Err(CoreError::contract(format!(
                    "parent {} belongs to project {}, not {}",
                    parent.id, parent.project_id, input.project_id
                ))
                .into());
            }
        }

        let now = self.clock.now();
        let task = input.into_task(TaskId::generate(), now)?;
        let task = self.store.insert_task(task).await?;

        info!(
            task_id = %task.id,
            project_id = %task.project_id,
            priority = task.priority,
            "Task created"
        );

        self.events
            .emit(EventRecord::new(
                task.project_id.clone(),
                EventType::TaskCreated,
                json!({
                    "task_id": task.id,
                    "title": task.title,
                    "priority": task.priority,
                    "parent_task_id": task.parent_task_id,
                    "status": task.status,
                }),
                trace_id,
                now,
            ))
            .await;

        Ok(task)
    }

    /// Make `task_id` wait for `depends_on`.
    pub async fn add_dependency(
        &self,
        task_id: &TaskId,
        depends_on: &TaskId,
        trace_id: Option<String>,
    ) -> Result<TaskDependency> {
        let dependency = TaskDependency::new(task_id.clone(), depends_on.clone())?;
        let task = self.get_task(task_id).await?;
        let upstream = self.get_task(depends_on).await?;

        if task.project_id != upstream.project_id {
            return Err(CoreError::contract(format!(
                "dependency {task_id} -> {depends_on} crosses projects"
            ))
            .into());
        }

        if self.reaches(depends_on, task_id).await? {
            return Err(CoreError::contract(format!(
                "dependency {task_id} -> {depends_on} would create a cycle"
            ))
            .into());
        }

        self.store.insert_dependency(dependency.clone()).await?;

        info!(task_id = %task_id, depends_on = %depends_on, "Dependency added");

        self.events
            .emit(EventRecord::new(
                task.project_id,
                EventType::DependencyAdded,
                json!({ "task_id": task_id, "depends_on": depends_on }),
                trace_id,
                self.clock.now(),
            ))
            .await;

        Ok(dependency)
    }

    /// Whether `target` is reachable from `from` along dependency edges.
    async fn reaches(&self, from: &TaskId, target: &TaskId) -> Result<bool> {
        let mut stack = vec![from.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if &current == target {
                return Ok(true);
            }
            if !seen.insert(current.clone()) {
                continue;
            }
            stack.extend(self.store.list_dependencies(&current).await?);
        }
        Ok(false)
    }

    /// Move a task to `to`, conditioned on `expected_version`.
    ///
    /// A self-transition succeeds without writing or emitting anything.
    pub async fn transition_task(
        &self,
        task_id: &TaskId,
        to: TaskStatus,
        expected_version: u64,
        actor: &str,
        trace_id: Option<String>,
    ) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        check_version("task", task_id.as_str(), expected_version, task.version)?;
        validate_transition(task.status, to)?;

        if task.status == to {
            return Ok(task);
        }

        let previous = task.status;
        let now = self.clock.now();
        let mut next = task;
        next.status = to;
        next.updated_at = now;

        let stored = match self.store.update_task(next, expected_version).await {
            Ok(stored) => stored,
            Err(e) => {
                if e.is_conflict() {
                    warn!(task_id = %task_id, error = %e, "Task update lost version race");
                }
                return Err(e.into());
            }
        };

        info!(
            task_id = %task_id,
            from = %previous,
            to = %to,
            actor = %actor,
            version = stored.version,
            "Task status changed"
        );

        self.events
            .emit(EventRecord::task_status_changed(
                stored.project_id.clone(),
                &TaskStatusChanged {
                    task_id: stored.id.clone(),
                    previous_status: previous,
                    new_status: to,
                    actor: actor.to_string(),
                    version: stored.version,
                },
                trace_id,
                now,
            ))
            .await;

        Ok(stored)
    }

    /// Resolve an operator verb and apply the resulting transition.
    pub async fn apply_command(
        &self,
        task_id: &TaskId,
        verb: &str,
        expected_version: u64,
        actor: &str,
        trace_id: Option<String>,
    ) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        check_version("task", task_id.as_str(), expected_version, task.version)?;

        let target = match resolve_verb(task.status, verb) {
            Ok(target) => target,
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    verb = %verb,
                    status = %task.status,
                    error = %e,
                    "Command rejected"
                );
                return Err(e.into());
            }
        };

        self.transition_task(task_id, target, expected_version, actor, trace_id)
            .await
    }

    /// Delete a task nothing else depends on.
    pub async fn delete_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        trace_id: Option<String>,
    ) -> Result<Task> {
        let dependents = self.store.list_dependents(task_id).await?;
        if !dependents.is_empty() {
            return Err(CoreError::contract(format!(
                "task {task_id} has {} dependent task(s)",
                dependents.len()
            ))
            .into());
        }
        let children = self.store.list_children(task_id).await?;
        if !children.is_empty() {
            return Err(CoreError::contract(format!(
                "task {task_id} has {} child task(s)",
                children.len()
            ))
            .into());
        }

        // Runs are never deleted, so neither is a task that has them.
        if !self.store.list_runs_for_task(task_id).await?.is_empty() {
            return Err(CoreError::contract(format!("task {task_id} has runs")).into());
        }

        let deleted = self.store.delete_task(task_id, expected_version).await?;
        info!(task_id = %task_id, "Task deleted");

        self.events
            .emit(EventRecord::new(
                deleted.project_id.clone(),
                EventType::TaskDeleted,
                json!({ "task_id": task_id }),
                trace_id,
                self.clock.now(),
            ))
            .await;

        Ok(deleted)
    }

    /// Best-effort move to `to` on behalf of the runtime.
    ///
    /// Re-reads on conflict a bounded number of times. A disallowed edge is
    /// logged and skipped. Returns the task if it ends up in `to`.
    pub async fn advance(
        &self,
        task_id: &TaskId,
        to: TaskStatus,
        actor: &str,
        trace_id: Option<String>,
    ) -> Option<Task> {
        for _ in 0..FOLLOW_THROUGH_ATTEMPTS {
            let task = match self.get_task(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Task follow-through skipped");
                    return None;
                }
            };
            if task.status == to {
                return Some(task);
            }
            if !can_transition(task.status, to) {
                debug!(
                    task_id = %task_id,
                    from = %task.status,
                    to = %to,
                    "Task follow-through not allowed"
                );
                return None;
            }

            match self
                .transition_task(task_id, to, task.version, actor, trace_id.clone())
                .await
            {
                Ok(task) => return Some(task),
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    warn!(task_id = %task_id, to = %to, error = %e, "Task follow-through failed");
                    return None;
                }
            }
        }
        warn!(task_id = %task_id, to = %to, "Task follow-through gave up after conflicts");
        None
    }
}
