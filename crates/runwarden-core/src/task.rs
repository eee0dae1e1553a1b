//! Task and dependency types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::{AgentId, ProjectId, TaskId, TaskStatus};

/// Highest scheduling priority.
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest scheduling priority.
pub const PRIORITY_LOWEST: u8 = 5;

/// A Task represents a logical unit of work within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Project this task belongs to.
    pub project_id: ProjectId,

    /// Short title.
    pub title: String,

    /// Free-form description handed to the agent.
    pub description: String,

    /// Current task status.
    pub status: TaskStatus,

    /// Scheduling priority, 1 (highest) to 5 (lowest).
    pub priority: u8,

    /// Agent expected to execute this task.
    pub assignee_agent_id: Option<AgentId>,

    /// Parent task in the same project.
    pub parent_task_id: Option<TaskId>,

    /// Optimistic-concurrency version, starts at 1.
    pub version: u64,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// When the task was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Check the row-level invariants.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_priority(self.priority)?;
        if self.version < 1 {
            return Err(CoreError::contract(format!(
                "task {} has version {}, expected >= 1",
                self.id, self.version
            )));
        }
        if self.parent_task_id.as_ref() == Some(&self.id) {
            return Err(CoreError::contract(format!(
                "task {} cannot be its own parent",
                self.id
            )));
        }
        Ok(())
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub assignee_agent_id: Option<AgentId>,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    /// Requested initial status. Anything other than `todo` is rejected.
    #[serde(default)]
    pub status: Option<TaskStatus>,
}

fn default_priority() -> u8 {
    3
}

impl NewTask {
    /// Create a new task input with default priority.
    pub fn new(project_id: ProjectId, title: impl Into<String>) -> Self {
        Self {
            project_id,
            title: title.into(),
            description: String::new(),
            priority: default_priority(),
            assignee_agent_id: None,
            parent_task_id: None,
            status: None,
        }
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Builder method to set the parent task.
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Builder method to set the assignee.
    pub fn with_assignee(mut self, agent: AgentId) -> Self {
        self.assignee_agent_id = Some(agent);
        self
    }

    /// Validate the input and build the task row.
    pub fn into_task(self, id: TaskId, now: DateTime<Utc>) -> Result<Task, CoreError> {
        if let Some(status) = self.status {
            if status != TaskStatus::Todo {
                return Err(CoreError::contract(format!(
                    "new tasks must be created in todo, got {status}"
                )));
            }
        }
        if self.title.trim().is_empty() {
            return Err(CoreError::InvalidInput("title is required".to_string()));
        }

        let task = Task {
            id,
            project_id: self.project_id,
            title: self.title,
            description: self.description,
            status: TaskStatus::Todo,
            priority: self.priority,
            assignee_agent_id: self.assignee_agent_id,
            parent_task_id: self.parent_task_id,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        task.validate()?;
        Ok(task)
    }
}

/// Validate a priority value.
pub fn validate_priority(priority: u8) -> Result<(), CoreError> {
    if (PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&priority) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!(
            "priority must be between {PRIORITY_HIGHEST} and {PRIORITY_LOWEST}, got {priority}"
        )))
    }
}

/// `task_id` cannot be scheduled before `depends_on` is done.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskDependency {
    pub task_id: TaskId,
    pub depends_on: TaskId,
}

impl TaskDependency {
    /// Create a dependency, rejecting self-references.
    pub fn new(task_id: TaskId, depends_on: TaskId) -> Result<Self, CoreError> {
        if task_id == depends_on {
            return Err(CoreError::contract(format!(
                "task {task_id} cannot depend on itself"
            )));
        }
        Ok(Self {
            task_id,
            depends_on,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_new_task_starts_in_todo() {
        let task = NewTask::new(ProjectId::new("p"), "write docs")
            .with_priority(1)
            .into_task(TaskId::new("t1"), now())
            .unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.version, 1);
        assert_eq!(task.priority, 1);
    }

    #[test]
    fn test_new_task_rejects_non_todo_status() {
        let mut input = NewTask::new(ProjectId::new("p"), "x");
        input.status = Some(TaskStatus::Running);
        let err = input.into_task(TaskId::new("t1"), now()).unwrap_err();
        assert!(matches!(err, CoreError::ContractViolation(_)));
    }

    #[test]
    fn test_priority_bounds() {
        assert!(validate_priority(0).is_err());
        assert!(validate_priority(1).is_ok());
        assert!(validate_priority(5).is_ok());
        assert!(validate_priority(6).is_err());
    }

    #[test]
    fn test_self_parent_rejected() {
        let err = NewTask::new(ProjectId::new("p"), "x")
            .with_parent(TaskId::new("t1"))
            .into_task(TaskId::new("t1"), now())
            .unwrap_err();
        assert!(matches!(err, CoreError::ContractViolation(_)));
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert!(TaskDependency::new(TaskId::new("a"), TaskId::new("a")).is_err());
        assert!(TaskDependency::new(TaskId::new("a"), TaskId::new("b")).is_ok());
    }

    #[test]
    fn test_new_task_deserializes_with_defaults() {
        let input: NewTask =
            serde_json::from_str(r#"{"project_id": "p", "title": "t"}"#).unwrap();
        assert_eq!(input.priority, 3);
        assert!(input.parent_task_id.is_none());
    }
}
