//! Orchestrator errors.

use thiserror::Error;

use runwarden_core::{CoreError, RunId, TaskId};

use crate::store::StoreError;

/// Errors returned by the task and runtime services.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),
}

impl OrchestratorError {
    /// Returns true if the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }

    /// Returns true if the requested move is not allowed from the current state.
    pub fn is_transition_rejection(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_transition_rejection())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
