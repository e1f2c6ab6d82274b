//! Flying a waypoint: the control loop and the policies it consults.
//!
//! The executor owns one `LoopState` per run and asks the policy modules
//! (escalation, clarification, envelope, intervention) what to do next.

pub mod clarification;
pub mod envelope;
pub mod escalation;
pub mod executor;
pub mod intervention;
pub mod kickoff;
pub mod memory;
pub mod prompts;
pub mod scope;
pub mod state;

pub use clarification::{ClarificationOutcome, MAX_CLARIFICATION_ROUNDS, handle_clarification_requests};
pub use envelope::{ContextEnvelope, ContextSlice, apply_context_envelope, clip_tool_output_for_context};
pub use escalation::{EscalationDecision, IterationObservation, ReasonCode, build_escalation_decision};
pub use executor::{ExecutionReport, ExecutorConfig, WaypointExecutor};
pub use intervention::{
    ErrorClassification, Intervention, InterventionAction, InterventionType, classify_execution_error,
};
pub use kickoff::{KickoffInput, build_iteration_kickoff_prompt, compute_spec_hash};
pub use memory::{WaypointMemoryRecord, load_waypoint_memory, load_waypoint_memory_context};
pub use scope::{DirectoryPolicy, is_outside_project, validate_no_external_changes};
pub use state::{LoopState, UsageTotals};
