//! Task state machine.
//!
//! Pure decision functions, no side effects. Callers consult these before
//! every task write.
//!
//! ```text
//! todo      -> running | blocked | cancelled
//! running   -> review | blocked | failed | cancelled
//! review    -> running | done | blocked | failed | cancelled
//! blocked   -> todo | running | cancelled
//! failed    -> todo | running | cancelled
//! cancelled -> todo
//! done      -> (terminal)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::TaskStatus;

/// Statuses reachable from `from` in one step (self-transition excluded).
pub fn allowed_targets(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Todo => &[Running, Blocked, Cancelled],
        Running => &[Review, Blocked, Failed, Cancelled],
        Review => &[Running, Done, Blocked, Failed, Cancelled],
        Blocked => &[Todo, Running, Cancelled],
        Failed => &[Todo, Running, Cancelled],
        Cancelled => &[Todo],
        Done => &[],
    }
}

/// Check whether `from -> to` is permitted. Same-status is a no-op success.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    from == to || allowed_targets(from).contains(&to)
}

/// Validate a task transition.
pub fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<(), CoreError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            entity: "task",
            from: from.to_string(),
            to: to.to_string(),
            allowed: allowed_targets(from)
                .iter()
                .map(|s| s.to_string())
                .collect(),
        })
    }
}

/// Operator verbs that resolve to a task transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCommand {
    Pause,
    Resume,
    Retry,
    Cancel,
}

impl TaskCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::Cancel => "cancel",
        }
    }

    /// Statuses the command may be applied from.
    pub fn sources(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Self::Pause => &[Running],
            Self::Resume => &[Blocked],
            Self::Retry => &[Failed, Cancelled],
            Self::Cancel => &[Todo, Running, Review, Blocked, Failed],
        }
    }

    /// Status the command moves the task to.
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Pause => TaskStatus::Blocked,
            Self::Resume => TaskStatus::Running,
            Self::Retry => TaskStatus::Todo,
            Self::Cancel => TaskStatus::Cancelled,
        }
    }
}

impl fmt::Display for TaskCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCommand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "retry" => Ok(Self::Retry),
            "cancel" => Ok(Self::Cancel),
            _ => Err(CoreError::InvalidCommand(s.to_string())),
        }
    }
}

/// Resolve a command against the current status into a target status.
pub fn resolve_command(current: TaskStatus, command: TaskCommand) -> Result<TaskStatus, CoreError> {
    let target = command.target();
    if !command.sources().contains(&current) {
        return Err(CoreError::InvalidTransition {
            entity: "task",
            from: current.to_string(),
            to: target.to_string(),
            allowed: command.sources().iter().map(|s| s.to_string()).collect(),
        });
    }
    validate_transition(current, target)?;
    Ok(target)
}

/// Parse and resolve an operator verb.
///
/// Unknown verbs fail with [`CoreError::InvalidCommand`]; known verbs applied
/// from the wrong status fail with [`CoreError::InvalidTransition`].
pub fn resolve_verb(current: TaskStatus, verb: &str) -> Result<TaskStatus, CoreError> {
    let command: TaskCommand = verb.parse()?;
    resolve_command(current, command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use TaskStatus::*;

    #[rstest]
    #[case(Todo, Running)]
    #[case(Todo, Blocked)]
    #[case(Todo, Cancelled)]
    #[case(Running, Review)]
    #[case(Running, Failed)]
    #[case(Review, Done)]
    #[case(Review, Running)]
    #[case(Blocked, Todo)]
    #[case(Failed, Running)]
    #[case(Cancelled, Todo)]
    fn allowed_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        assert!(validate_transition(from, to).is_ok());
    }

    #[rstest]
    #[case(Todo, Done)]
    #[case(Todo, Review)]
    #[case(Running, Todo)]
    #[case(Cancelled, Running)]
    #[case(Done, Todo)]
    #[case(Done, Running)]
    #[case(Blocked, Done)]
    fn rejected_edges(#[case] from: TaskStatus, #[case] to: TaskStatus) {
        let err = validate_transition(from, to).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn self_transition_is_noop_success() {
        for status in TaskStatus::ALL {
            assert!(validate_transition(status, status).is_ok());
        }
    }

    #[test]
    fn invalid_transition_reports_allowed_set() {
        match validate_transition(Cancelled, Done).unwrap_err() {
            CoreError::InvalidTransition { from, to, allowed, .. } => {
                assert_eq!(from, "cancelled");
                assert_eq!(to, "done");
                assert_eq!(allowed, vec!["todo".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[rstest]
    #[case(Running, "pause", Blocked)]
    #[case(Blocked, "resume", Running)]
    #[case(Failed, "retry", Todo)]
    #[case(Cancelled, "retry", Todo)]
    #[case(Review, "cancel", Cancelled)]
    #[case(Todo, "CANCEL", Cancelled)]
    fn commands_resolve(#[case] from: TaskStatus, #[case] verb: &str, #[case] to: TaskStatus) {
        assert_eq!(resolve_verb(from, verb).unwrap(), to);
    }

    #[test]
    fn unknown_verb_is_invalid_command() {
        let err = resolve_verb(Running, "explode").unwrap_err();
        assert!(matches!(err, CoreError::InvalidCommand(_)));
    }

    #[test]
    fn wrong_source_is_invalid_transition() {
        let err = resolve_verb(Todo, "pause").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let err = resolve_verb(Done, "cancel").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
    }

    #[test]
    fn every_command_target_is_an_edge() {
        for command in [
            TaskCommand::Pause,
            TaskCommand::Resume,
            TaskCommand::Retry,
            TaskCommand::Cancel,
        ] {
            for source in command.sources() {
                assert!(can_transition(*source, command.target()));
            }
        }
    }
}
