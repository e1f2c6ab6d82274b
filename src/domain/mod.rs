//! Domain types for waypoint-fly
//!
//! This module contains the core domain types:
//! - Waypoint: the unit of work with its acceptance criteria and status
//! - ExecutionResult / ExecutionState: terminal outcomes and executor state
//! - ExecutionContext: progress events streamed to observers
//! - CancelSignal: cooperative cancellation polled between iterations

pub mod event;
pub mod outcome;
pub mod signal;
pub mod waypoint;

pub use event::{ExecutionContext, ExecutionStep, ProgressReceiver, ProgressSender, progress_channel};
pub use outcome::{ExecutionResult, ExecutionState};
pub use signal::{CancelSignal, NoOpCancelSignal, PauseFlag};
pub use waypoint::{Waypoint, WaypointStatus};
