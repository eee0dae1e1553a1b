//! Core domain errors.

use thiserror::Error;

/// Core domain errors for runwarden.
///
/// Invalid transitions and invalid commands are separate variants so that
/// callers can tell "unknown verb" apart from "verb not allowed right now"
/// when writing audit records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Requested move is not an edge of the state machine.
    #[error("Invalid {entity} transition: {from} -> {to} (allowed: {})", format_allowed(.allowed))]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
        allowed: Vec<String>,
    },

    /// Operator verb is not supported.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// Malformed input to a state-machine or runtime call.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A persisted status string did not match any known value.
    #[error("Unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },
}

impl CoreError {
    /// Shorthand for a contract violation.
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }

    /// Returns true for errors callers may resolve by choosing another action.
    pub fn is_transition_rejection(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. } | Self::InvalidCommand(_))
    }
}

fn format_allowed(allowed: &[String]) -> String {
    if allowed.is_empty() {
        "none".to_string()
    } else {
        allowed.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_lists_allowed_targets() {
        let err = CoreError::InvalidTransition {
            entity: "task",
            from: "done".to_string(),
            to: "running".to_string(),
            allowed: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Invalid task transition: done -> running (allowed: none)"
        );
    }

    #[test]
    fn test_transition_rejection_kinds() {
        assert!(CoreError::InvalidCommand("explode".into()).is_transition_rejection());
        assert!(!CoreError::contract("empty key").is_transition_rejection());
    }
}
