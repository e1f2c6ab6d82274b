//! Deterministic agent that replays a prepared transcript

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::client::{AgentClient, AgentError, AgentEvent, AgentRequest, TurnSummary};
use crate::error::{FlyError, Result};

/// Error a scripted turn raises instead of completing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptedError {
    RateLimited,
    ApiError { status: u16, message: String },
    BudgetExceeded { limit_usd: f64, current_usd: f64 },
    Transport { message: String },
    Other { message: String },
}

impl From<&ScriptedError> for AgentError {
    fn from(err: &ScriptedError) -> Self {
        match err {
            ScriptedError::RateLimited => AgentError::RateLimited { retry_after: None },
            ScriptedError::ApiError { status, message } => AgentError::ApiError {
                status: *status,
                message: message.clone(),
            },
            ScriptedError::BudgetExceeded { limit_usd, current_usd } => AgentError::BudgetExceeded {
                limit_usd: *limit_usd,
                current_usd: *current_usd,
            },
            ScriptedError::Transport { message } => AgentError::Transport(message.clone()),
            ScriptedError::Other { message } => AgentError::Other(message.clone()),
        }
    }
}

/// One prepared turn: events in order, then completion or an error
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default)]
    pub events: Vec<AgentEvent>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub error: Option<ScriptedError>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            events: vec![AgentEvent::Text { text: text.into() }],
            ..Default::default()
        }
    }

    pub fn failing(error: ScriptedError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_tool(mut self, tool_name: &str, tool_input: serde_json::Value, tool_output: Option<&str>) -> Self {
        self.events.push(AgentEvent::ToolUse {
            tool_name: tool_name.to_string(),
            tool_input,
            tool_output: tool_output.map(str::to_string),
        });
        self
    }

    pub fn then_text(mut self, text: impl Into<String>) -> Self {
        self.events.push(AgentEvent::Text { text: text.into() });
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

/// Replays turns in order and records every request it receives
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Load a transcript: a JSON array of turns
    pub fn from_transcript(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let turns: Vec<ScriptedTurn> = serde_json::from_str(&content)?;
        if turns.is_empty() {
            return Err(FlyError::InvalidState(format!(
                "Transcript {} contains no turns",
                path.display()
            )));
        }
        Ok(Self::new(turns))
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn turn(&self, request: AgentRequest, events: mpsc::Sender<AgentEvent>) -> std::result::Result<TurnSummary, AgentError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .turns
            .lock()
            .map_err(|e| AgentError::Other(e.to_string()))?
            .pop_front();
        let Some(turn) = next else {
            return Err(AgentError::Other("Scripted transcript exhausted".to_string()));
        };

        let mut full_text = String::new();
        for event in turn.events {
            if let AgentEvent::Text { text } = &event {
                full_text.push_str(text);
            }
            if events.send(event).await.is_err() {
                return Err(AgentError::Transport("event receiver dropped".to_string()));
            }
        }

        if let Some(err) = &turn.error {
            return Err(err.into());
        }

        let summary = TurnSummary {
            full_text,
            session_id: turn.session_id,
            cost_usd: turn.cost_usd,
            ..Default::default()
        };
        // A closed receiver at this point only loses the duplicate summary
        let _ = events.send(AgentEvent::Complete(summary.clone())).await;
        Ok(summary)
    }
}
