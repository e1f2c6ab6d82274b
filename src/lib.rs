//! waypoint-fly - supervised agent execution of planned waypoints
//!
//! A waypoint is flown by an iterative control loop that drives a coding
//! agent, reads the structured protocol out of its output, re-prompts or
//! escalates, and finally hands a code-built receipt to a commit gate.
//! Nothing is committed on the agent's word alone.

pub mod agent;
pub mod domain;
pub mod error;
pub mod fly;
pub mod git;
pub mod protocol;
pub mod runtime;

pub use error::{FlyError, Result};
