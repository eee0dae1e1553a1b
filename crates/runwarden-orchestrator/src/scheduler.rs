//! Readiness scheduler - decides which task may run next.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use runwarden_core::{ProjectId, Task, TaskId, TaskStatus};

use crate::error::Result;
use crate::store::Store;

/// Read-only view over the task graph of a project.
pub struct ReadinessScheduler {
    store: Arc<dyn Store>,
}

impl ReadinessScheduler {
    /// Create a new ReadinessScheduler.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// `todo` tasks whose parent and dependencies are all `done`.
    ///
    /// Ordered by priority, then by the most recent `updated_at` among the
    /// parent and dependencies (the task's own when it has none), newest
    /// first, then by task id.
    pub async fn list_schedulable(&self, project_id: &ProjectId) -> Result<Vec<Task>> {
        let tasks = self.store.list_tasks(project_id).await?;
        let by_id: HashMap<&TaskId, &Task> = tasks.iter().map(|t| (&t.id, t)).collect();

        let mut ready: Vec<(DateTime<Utc>, &Task)> = Vec::new();
        'tasks: for task in tasks.iter().filter(|t| t.status == TaskStatus::Todo) {
            let mut upstream: Vec<TaskId> = self.store.list_dependencies(&task.id).await?;
            upstream.extend(task.parent_task_id.iter().cloned());

            let mut context: Option<DateTime<Utc>> = None;
            for id in &upstream {
                match by_id.get(id) {
                    Some(t) if t.status == TaskStatus::Done => {
                        context = context.max(Some(t.updated_at));
                    }
                    _ => {
                        debug!(task_id = %task.id, blocked_by = %id, "Task not ready");
                        continue 'tasks;
                    }
                }
            }
            ready.push((context.unwrap_or(task.updated_at), task));
        }

        ready.sort_by_key(|(context, t)| (t.priority, Reverse(*context), t.id.clone()));
        Ok(ready.into_iter().map(|(_, t)| t.clone()).collect())
    }

    /// Head of [`Self::list_schedulable`].
    pub async fn pick_next(&self, project_id: &ProjectId) -> Result<Option<Task>> {
        Ok(self.list_schedulable(project_id).await?.into_iter().next())
    }
}
