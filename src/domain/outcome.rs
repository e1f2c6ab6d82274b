//! Execution outcome and state types.

use serde::{Deserialize, Serialize};

use crate::fly::intervention::Intervention;

/// Terminal outcome of flying one waypoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Completion marker observed and every criterion verified
    Success,
    /// Unrecoverable failure with a human-readable reason
    Failed(String),
    /// Iteration budget spent without completion
    MaxIterations,
    /// Pause flag observed at an iteration boundary
    Cancelled,
    /// Control handed to a human
    InterventionNeeded(Intervention),
}

impl ExecutionResult {
    /// Short stable label used in logs and waypoint memory
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Success => "success",
            ExecutionResult::Failed(_) => "failed",
            ExecutionResult::MaxIterations => "max_iterations",
            ExecutionResult::Cancelled => "cancelled",
            ExecutionResult::InterventionNeeded(_) => "intervention_needed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success)
    }
}

/// Coarse state of the executor as seen by a presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Idle,
    Running,
    /// Pause requested, current iteration still finishing
    PausePending,
    Paused,
    Done,
    Intervention,
}

impl ExecutionState {
    /// Whether a move to `next` is allowed
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, PausePending)
                | (Running, Done)
                | (Running, Intervention)
                | (PausePending, Paused)
                | (PausePending, Done)
                | (PausePending, Intervention)
                | (Paused, Running)
                | (Intervention, Running)
                | (Done, Idle)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_result_labels() {
        assert_eq!(ExecutionResult::Success.label(), "success");
        assert_eq!(ExecutionResult::Failed("x".into()).label(), "failed");
        assert_eq!(ExecutionResult::MaxIterations.label(), "max_iterations");
        assert_eq!(ExecutionResult::Cancelled.label(), "cancelled");
    }

    #[test]
    fn test_execution_result_equality() {
        assert_eq!(ExecutionResult::Success, ExecutionResult::Success);
        assert_ne!(ExecutionResult::Success, ExecutionResult::Cancelled);
        assert!(ExecutionResult::Success.is_success());
        assert!(!ExecutionResult::MaxIterations.is_success());
    }

    #[test]
    fn test_state_transitions() {
        assert!(ExecutionState::Idle.can_transition_to(ExecutionState::Running));
        assert!(ExecutionState::Running.can_transition_to(ExecutionState::PausePending));
        assert!(ExecutionState::PausePending.can_transition_to(ExecutionState::Paused));
        assert!(!ExecutionState::Idle.can_transition_to(ExecutionState::Done));
        assert!(!ExecutionState::Paused.can_transition_to(ExecutionState::Done));
    }

    #[test]
    fn test_state_default_idle() {
        assert_eq!(ExecutionState::default(), ExecutionState::Idle);
    }
}
