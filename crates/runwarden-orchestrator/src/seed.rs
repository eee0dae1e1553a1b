//! Seed plans: a JSON list of tasks and dependencies loaded at startup.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use runwarden_core::{AgentId, NewTask, ProjectId, TaskId};

use crate::error::OrchestratorError;
use crate::tasks::TaskService;

/// Seed plan errors.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("Failed to read plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid plan: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown task key in plan: {0}")]
    UnknownKey(String),

    #[error("Duplicate task key in plan: {0}")]
    DuplicateKey(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// A plan file.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedPlan {
    pub tasks: Vec<SeedTask>,
}

/// One task of a plan, referring to others by `key`.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedTask {
    pub key: String,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub assignee: Option<AgentId>,
    /// Key of the parent task, which must appear earlier in the plan.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_priority() -> u8 {
    3
}

impl SeedPlan {
    /// Read a plan from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Create every task, then every dependency. Returns the projects touched
    /// and the created ids by key.
    pub async fn apply(
        &self,
        tasks: &TaskService,
    ) -> Result<(Vec<ProjectId>, HashMap<String, TaskId>), SeedError> {
        let mut ids: HashMap<String, TaskId> = HashMap::new();
        let mut projects = BTreeSet::new();

        for seed in &self.tasks {
            if ids.contains_key(&seed.key) {
                return Err(SeedError::DuplicateKey(seed.key.clone()));
            }

            let mut input = NewTask::new(seed.project_id.clone(), seed.title.clone())
                .with_description(seed.description.clone())
                .with_priority(seed.priority);
            if let Some(agent) = &seed.assignee {
                input = input.with_assignee(agent.clone());
            }
            if let Some(parent) = &seed.parent {
                let parent_id = ids
                    .get(parent)
                    .ok_or_else(|| SeedError::UnknownKey(parent.clone()))?;
                input = input.with_parent(parent_id.clone());
            }

            let task = tasks.create_task(input, Some(format!("seed:{}", seed.key))).await?;
            projects.insert(task.project_id.clone());
            ids.insert(seed.key.clone(), task.id);
        }

        for seed in &self.tasks {
            let task_id = &ids[&seed.key];
            for upstream in &seed.depends_on {
                let upstream_id = ids
                    .get(upstream)
                    .ok_or_else(|| SeedError::UnknownKey(upstream.clone()))?;
                tasks
                    .add_dependency(task_id, upstream_id, Some(format!("seed:{}", seed.key)))
                    .await?;
            }
        }

        info!(tasks = ids.len(), projects = projects.len(), "Seed plan loaded");
        Ok((projects.into_iter().collect(), ids))
    }
}
