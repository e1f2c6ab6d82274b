//! Error types for waypoint-fly
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// All error types that can occur while flying a waypoint
#[derive(Debug, Error)]
pub enum FlyError {
    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Agent turn failed
    #[error("Agent error: {0}")]
    Agent(#[from] crate::agent::AgentError),

    /// Subprocess could not be spawned or awaited
    #[error("Command error: {0}")]
    Command(String),

    /// Version control operation failed
    #[error("Git error: {0}")]
    Git(String),

    /// Receipt could not be read or written
    #[error("Receipt error: {0}")]
    Receipt(String),

    /// Artifact log, history or memory persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration rejected
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for waypoint-fly operations
pub type Result<T> = std::result::Result<T, FlyError>;
