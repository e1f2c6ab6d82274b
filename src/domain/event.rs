//! Progress events emitted by the control loop
//!
//! The executor never renders anything itself; it pushes `ExecutionContext`
//! values into a channel and whoever holds the receiver decides how to show them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;

use crate::protocol::FileOperation;

/// Which step of an iteration produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStep {
    Executing,
    ToolUse,
    Streaming,
    Complete,
    Error,
    Stage,
    Finalizing,
    ProtocolArtifact,
    ValidationFailed,
    ClarificationPending,
    Warning,
}

/// Snapshot of progress sent to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub waypoint_id: String,
    pub step: ExecutionStep,
    /// 1-based iteration number
    pub iteration: u32,
    pub total_iterations: u32,
    /// Text associated with the step (chunk, warning message, stage summary)
    pub output: String,
    pub criteria_completed: BTreeSet<usize>,
    #[serde(default)]
    pub file_operations: Vec<FileOperation>,
}

/// Sending half of the progress channel
pub type ProgressSender = mpsc::UnboundedSender<ExecutionContext>;

/// Receiving half of the progress channel
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionContext>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionStep::ClarificationPending).unwrap();
        assert_eq!(json, "\"clarification_pending\"");
    }

    #[tokio::test]
    async fn test_progress_channel_delivers() {
        let (tx, mut rx) = progress_channel();
        tx.send(ExecutionContext {
            waypoint_id: "WP-1".into(),
            step: ExecutionStep::Executing,
            iteration: 1,
            total_iterations: 10,
            output: "Starting".into(),
            criteria_completed: BTreeSet::new(),
            file_operations: vec![],
        })
        .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.step, ExecutionStep::Executing);
        assert_eq!(event.total_iterations, 10);
    }
}
