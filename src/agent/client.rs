//! Agent-turn trait and the types that cross it

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Tools the executor allows by default
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep"];

/// One autonomous agent turn against a working directory.
///
/// Implementations stream events into `events` while the turn runs and return
/// the completion summary once the agent stops.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn turn(&self, request: AgentRequest, events: mpsc::Sender<AgentEvent>) -> Result<TurnSummary, AgentError>;
}

/// Everything needed for one agent turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub cwd: PathBuf,
    /// Session to resume, if the provider supports it
    pub resume_session_id: Option<String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            cwd: cwd.into(),
            resume_session_id: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = tools;
        self
    }

    pub fn resume(mut self, session_id: Option<String>) -> Self {
        self.resume_session_id = session_id;
        self
    }
}

/// Streamed during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Text being generated
    Text { text: String },

    /// A tool call the agent made, with its output when available
    ToolUse {
        tool_name: String,
        tool_input: serde_json::Value,
        #[serde(default)]
        tool_output: Option<String>,
    },

    /// Turn finished
    Complete(TurnSummary),
}

/// Final stats for a turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    #[serde(default)]
    pub full_text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tokens_in: Option<u64>,
    #[serde(default)]
    pub tokens_out: Option<u64>,
    #[serde(default)]
    pub cached_tokens_in: Option<u64>,
}

/// Errors raised by an agent turn
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Budget exceeded: limit ${limit_usd:.2}, current ${current_usd:.2}")]
    BudgetExceeded { limit_usd: f64, current_usd: f64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

/// Provider-agnostic error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    RateLimited,
    Unavailable,
    BudgetExceeded,
    Unknown,
}

impl AgentError {
    /// Kind implied by the variant alone, before any message scanning
    pub fn structured_kind(&self) -> ProviderErrorKind {
        match self {
            AgentError::RateLimited { .. } => ProviderErrorKind::RateLimited,
            AgentError::BudgetExceeded { .. } => ProviderErrorKind::BudgetExceeded,
            AgentError::ApiError { status: 429, .. } => ProviderErrorKind::RateLimited,
            AgentError::ApiError { status, .. } if *status >= 500 => ProviderErrorKind::Unavailable,
            _ => ProviderErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.structured_kind(),
            ProviderErrorKind::RateLimited | ProviderErrorKind::Unavailable
        )
    }
}
