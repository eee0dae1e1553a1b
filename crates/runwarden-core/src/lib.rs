//! runwarden Core Domain Types
//!
//! This crate contains pure domain types and decision functions with no
//! dependencies on:
//! - An async runtime
//! - Storage
//! - Provider adapters
//!
//! The task and run state machines live here so that every writer consults
//! the same edge tables before touching storage.

pub mod alert;
pub mod error;
pub mod event;
pub mod ids;
pub mod provider;
pub mod run;
pub mod run_machine;
pub mod status;
pub mod task;
pub mod task_machine;

// Re-export commonly used types
pub use alert::{Alert, AlertKind, AlertSourceId, AlertStatus};
pub use error::CoreError;
pub use event::{EventRecord, EventType, RunStatusChanged, TaskStatusChanged};
pub use ids::{AgentId, AlertId, EventId, ProjectId, RunId, TaskId};
pub use provider::{
    ProviderError, ProviderErrorKind, ProviderRequest, ProviderResponse, ToolCall, Usage,
};
pub use run::{RunLog, RunTransition, TaskRun};
pub use run_machine::{RunChange, RunPlan};
pub use status::{RunStatus, TaskStatus};
pub use task::{NewTask, Task, TaskDependency};
pub use task_machine::TaskCommand;
