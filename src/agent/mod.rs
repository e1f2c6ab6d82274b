//! Agent layer - the opaque streaming turn interface
//!
//! This module provides:
//! - AgentClient trait for one autonomous turn against a working directory
//! - Request, event and summary types
//! - ScriptedAgent for tests and transcript replay

pub mod client;
pub mod scripted;

pub use client::{
    AgentClient, AgentError, AgentEvent, AgentRequest, DEFAULT_ALLOWED_TOOLS, ProviderErrorKind, TurnSummary,
};
pub use scripted::{ScriptedAgent, ScriptedError, ScriptedTurn};
