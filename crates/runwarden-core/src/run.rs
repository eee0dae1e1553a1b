//! TaskRun rows and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provider::Usage;
use crate::{AgentId, RunId, RunStatus, TaskId};

/// One execution attempt of a task against a language-model provider.
///
/// Runs are never deleted; together with [`RunTransition`] rows they form
/// the execution audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Task this run executes.
    pub task_id: TaskId,

    /// Agent executing the run.
    pub agent_id: Option<AgentId>,

    /// Current run status.
    pub status: RunStatus,

    /// Attempt number for the task, starting at 1.
    pub attempt: u32,

    /// Request deduplication token, unique across all runs.
    pub idempotency_key: String,

    /// When the run last entered `running`.
    pub started_at: Option<DateTime<Utc>>,

    /// When the run last left `running` for a non-running state.
    pub ended_at: Option<DateTime<Utc>>,

    /// When a scheduled retry becomes due.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Machine-readable failure code.
    pub error_code: Option<String>,

    /// Redacted, truncated failure message.
    pub error_message: Option<String>,

    /// Cumulative input tokens.
    pub token_in: u64,

    /// Cumulative output tokens.
    pub token_out: u64,

    /// Cumulative cost in USD.
    pub cost_usd: f64,

    /// Optimistic-concurrency version, starts at 1.
    pub version: u64,

    /// When the run row was created.
    pub created_at: DateTime<Utc>,

    /// When the run row was last mutated.
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    /// Create a queued run.
    pub fn new(
        task_id: TaskId,
        agent_id: Option<AgentId>,
        attempt: u32,
        idempotency_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::generate(),
            task_id,
            agent_id,
            status: RunStatus::Queued,
            attempt,
            idempotency_key: idempotency_key.into(),
            started_at: None,
            ended_at: None,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            token_in: 0,
            token_out: 0,
            cost_usd: 0.0,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add provider usage to the running totals.
    pub fn accumulate_usage(&mut self, usage: &Usage) {
        self.token_in = self.token_in.saturating_add(usage.token_in);
        self.token_out = self.token_out.saturating_add(usage.token_out);
        if usage.cost_usd.is_finite() && usage.cost_usd > 0.0 {
            self.cost_usd += usage.cost_usd;
        }
    }

    /// Time of the most recent known activity, ignoring log lines.
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// One applied status change of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTransition {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
    pub actor: String,
    pub error_code: Option<String>,
    pub at: DateTime<Utc>,
}

/// A log line produced while a run executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Redacted message text.
    pub message: String,
    /// Hex sha256 of the message, used for repetition checks.
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut run = TaskRun::new(TaskId::new("t"), None, 1, "k", Utc::now());
        run.accumulate_usage(&Usage::new(10, 20, 0.5));
        run.accumulate_usage(&Usage::new(1, 2, 0.25));
        assert_eq!(run.token_in, 11);
        assert_eq!(run.token_out, 22);
        assert!((run.cost_usd - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_negative_cost_is_ignored() {
        let mut run = TaskRun::new(TaskId::new("t"), None, 1, "k", Utc::now());
        run.accumulate_usage(&Usage::new(0, 0, -3.0));
        assert_eq!(run.cost_usd, 0.0);
    }
}
