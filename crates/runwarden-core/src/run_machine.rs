//! Run state machine and field contract.
//!
//! ```text
//! queued          -> running | cancelled
//! running         -> succeeded | failed | retry_scheduled | cancelled | interrupted
//! retry_scheduled -> running | cancelled
//! interrupted     -> running | succeeded | failed | cancelled
//! succeeded, failed, cancelled: terminal
//! ```
//!
//! [`plan_transition`] is a pure function: it computes the next row from the
//! current one and never touches storage. Version bumps belong to the store.

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::provider::Usage;
use crate::run::TaskRun;
use crate::RunStatus;

/// Statuses reachable from `from` in one step (self-transition excluded).
pub fn allowed_targets(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Queued => &[Running, Cancelled],
        Running => &[Succeeded, Failed, RetryScheduled, Cancelled, Interrupted],
        RetryScheduled => &[Running, Cancelled],
        Interrupted => &[Running, Succeeded, Failed, Cancelled],
        Succeeded | Failed | Cancelled => &[],
    }
}

/// Check whether `from -> to` is permitted. Same-status is a no-op success.
pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

/// Validate a run transition.
pub fn validate_transition(from: RunStatus, to: RunStatus) -> Result<(), CoreError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            entity: "run",
            from: from.to_string(),
            to: to.to_string(),
            allowed: allowed_targets(from)
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }
}

/// Enforce the per-state field invariants of a run row.
pub fn validate_fields(run: &TaskRun) -> Result<(), CoreError> {
    if run.idempotency_key.trim().is_empty() {
        return Err(CoreError::contract(format!(
            "run {} has an empty idempotency_key",
            run.id
        )));
    }
    if run.attempt < 1 {
        return Err(CoreError::contract(format!(
            "run {} has attempt {}, expected >= 1",
            run.id, run.attempt
        )));
    }

    let retry_scheduled = run.status == RunStatus::RetryScheduled;
    match (retry_scheduled, run.next_retry_at.is_some()) {
        (true, false) => {
            return Err(CoreError::contract(format!(
                "run {} is retry_scheduled without next_retry_at",
                run.id
            )))
        }
        (false, true) => {
            return Err(CoreError::contract(format!(
                "run {} has next_retry_at while {}",
                run.id, run.status
            )))
        }
        _ => {}
    }

    let error_allowed = !matches!(
        run.status,
        RunStatus::Queued | RunStatus::Running | RunStatus::Succeeded
    );
    if !error_allowed && (run.error_code.is_some() || run.error_message.is_some()) {
        return Err(CoreError::contract(format!(
            "run {} carries error fields while {}",
            run.id, run.status
        )));
    }

    Ok(())
}

/// A requested change to a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunChange {
    pub to: RunStatus,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub usage: Option<Usage>,
}

impl RunChange {
    /// Move to `to` without extra fields.
    pub fn to(status: RunStatus) -> Self {
        Self {
            to: status,
            next_retry_at: None,
            error_code: None,
            error_message: None,
            usage: None,
        }
    }

    /// Transition to `running`.
    pub fn start() -> Self {
        Self::to(RunStatus::Running)
    }

    /// Transition to `succeeded`, adding provider usage.
    pub fn succeed(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::to(RunStatus::Succeeded)
        }
    }

    /// Transition to `retry_scheduled`.
    pub fn schedule_retry(
        next_retry_at: DateTime<Utc>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            next_retry_at: Some(next_retry_at),
            ..Self::to(RunStatus::RetryScheduled).with_error(code, message)
        }
    }

    /// Transition to `failed`.
    pub fn fail(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::to(RunStatus::Failed).with_error(code, message)
    }

    /// Transition to `interrupted`.
    pub fn interrupt(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::to(RunStatus::Interrupted).with_error(code, message)
    }

    /// Transition to `cancelled`.
    pub fn cancel() -> Self {
        Self::to(RunStatus::Cancelled)
    }

    /// Builder method to attach error fields.
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

/// Outcome of planning a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum RunPlan {
    /// Run already in the requested status; nothing to write.
    Noop,
    /// Row to write, conditioned on the current version.
    Apply(TaskRun),
}

/// Compute the row that results from applying `change` to `current`.
///
/// The returned row keeps `current.version`; the store bumps it on write.
pub fn plan_transition(
    current: &TaskRun,
    change: RunChange,
    now: DateTime<Utc>,
) -> Result<RunPlan, CoreError> {
    validate_fields(current)?;
    if current.status == change.to {
        return Ok(RunPlan::Noop);
    }
    validate_transition(current.status, change.to)?;

    let mut next = current.clone();
    next.status = change.to;
    next.updated_at = now;
    next.next_retry_at = change.next_retry_at;

    match change.to {
        RunStatus::Running => {
            next.started_at = Some(now);
            next.ended_at = None;
            next.error_code = None;
            next.error_message = None;
        }
        RunStatus::RetryScheduled
        | RunStatus::Succeeded
        | RunStatus::Failed
        | RunStatus::Cancelled
        | RunStatus::Interrupted => {
            next.ended_at = Some(now);
            next.error_code = change.error_code;
            next.error_message = change.error_message;
        }
        RunStatus::Queued => {}
    }

    if let Some(usage) = change.usage {
        next.accumulate_usage(&usage);
    }

    validate_fields(&next)?;
    Ok(RunPlan::Apply(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskId;
    use chrono::Duration;
    use rstest::rstest;
    use RunStatus::*;

    fn run_in(status: RunStatus) -> TaskRun {
        let mut run = TaskRun::new(TaskId::new("t"), None, 1, "key-1", Utc::now());
        run.status = status;
        if status == RetryScheduled {
            run.next_retry_at = Some(Utc::now());
        }
        run
    }

    #[rstest]
    #[case(Queued, Running)]
    #[case(Running, Succeeded)]
    #[case(Running, RetryScheduled)]
    #[case(Running, Interrupted)]
    #[case(RetryScheduled, Running)]
    #[case(Interrupted, Running)]
    #[case(Interrupted, Failed)]
    #[case(Interrupted, Succeeded)]
    fn allowed_edges(#[case] from: RunStatus, #[case] to: RunStatus) {
        assert!(validate_transition(from, to).is_ok());
    }

    #[rstest]
    #[case(Queued, Succeeded)]
    #[case(Succeeded, Running)]
    #[case(Failed, Running)]
    #[case(Cancelled, Queued)]
    #[case(RetryScheduled, Succeeded)]
    fn rejected_edges(#[case] from: RunStatus, #[case] to: RunStatus) {
        assert!(validate_transition(from, to).is_err());
    }

    #[test]
    fn terminal_states_allow_only_noop() {
        for status in [Succeeded, Failed, Cancelled] {
            let run = run_in(status);
            assert_eq!(
                plan_transition(&run, RunChange::to(status), Utc::now()).unwrap(),
                RunPlan::Noop
            );
            assert!(plan_transition(&run, RunChange::start(), Utc::now()).is_err());
        }
    }

    #[test]
    fn retry_scheduled_requires_next_retry_at() {
        let run = run_in(Running);
        let change = RunChange::to(RetryScheduled).with_error("timeout", "slow");
        let err = plan_transition(&run, change, Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::ContractViolation(_)));
    }

    #[test]
    fn next_retry_at_only_while_retry_scheduled() {
        let mut run = run_in(Running);
        run.next_retry_at = Some(Utc::now());
        assert!(validate_fields(&run).is_err());
    }

    #[test]
    fn empty_idempotency_key_rejected() {
        let mut run = run_in(Queued);
        run.idempotency_key = "  ".to_string();
        assert!(matches!(
            validate_fields(&run).unwrap_err(),
            CoreError::ContractViolation(_)
        ));
    }

    #[test]
    fn start_clears_retry_and_error_fields() {
        let now = Utc::now();
        let mut run = run_in(Running);
        run = match plan_transition(
            &run,
            RunChange::schedule_retry(now + Duration::seconds(5), "timeout", "slow"),
            now,
        )
        .unwrap()
        {
            RunPlan::Apply(next) => next,
            RunPlan::Noop => panic!("expected a write"),
        };
        assert_eq!(run.ended_at, Some(now));

        let later = now + Duration::seconds(10);
        let RunPlan::Apply(resumed) = plan_transition(&run, RunChange::start(), later).unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(resumed.status, Running);
        assert_eq!(resumed.started_at, Some(later));
        assert!(resumed.next_retry_at.is_none());
        assert!(resumed.error_code.is_none());
        assert!(resumed.ended_at.is_none());
    }

    #[test]
    fn plan_keeps_version_and_accumulates_usage() {
        let mut run = run_in(Running);
        run.version = 4;
        run.token_in = 5;
        let RunPlan::Apply(next) =
            plan_transition(&run, RunChange::succeed(Usage::new(10, 3, 0.01)), Utc::now())
                .unwrap()
        else {
            panic!("expected a write");
        };
        assert_eq!(next.version, 4);
        assert_eq!(next.token_in, 15);
        assert_eq!(next.token_out, 3);
    }
}
