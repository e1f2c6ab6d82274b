//! Waypoint record and lifecycle status
//!
//! A waypoint is one discrete, independently testable unit of planned work.
//! Planning creates it; only the control loop and the receipt gate mutate it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Lifecycle status of a waypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaypointStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Control loop is running against it
    InProgress,
    /// Gave up or escalated
    Failed,
    /// Skipped by operator decision
    Skipped,
    /// Receipt validated and accepted
    Complete,
}

impl WaypointStatus {
    /// Returns true if the waypoint will not be attempted again without operator action
    pub fn is_terminal(&self) -> bool {
        matches!(self, WaypointStatus::Complete | WaypointStatus::Skipped)
    }
}

impl std::fmt::Display for WaypointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WaypointStatus::Pending => "pending",
            WaypointStatus::InProgress => "in_progress",
            WaypointStatus::Failed => "failed",
            WaypointStatus::Skipped => "skipped",
            WaypointStatus::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// A single waypoint in the flight plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waypoint {
    /// Identifier such as "WP-003"
    pub id: String,

    pub title: String,

    pub objective: String,

    /// Ordered acceptance criteria; the index is the protocol's `<index>`
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    #[serde(default)]
    pub parent_id: Option<String>,

    /// Waypoint ids that must complete first
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Product spec section headings this waypoint was planned against
    #[serde(default)]
    pub spec_context_refs: Vec<String>,

    /// One-paragraph summary of the relevant spec context
    #[serde(default)]
    pub spec_context_summary: String,

    /// Hash of the product spec at planning time
    #[serde(default)]
    pub spec_context_hash: Option<String>,

    #[serde(default)]
    pub status: WaypointStatus,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Waypoint {
    /// Create a pending waypoint
    pub fn new(id: impl Into<String>, title: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            objective: objective.into(),
            acceptance_criteria: Vec::new(),
            parent_id: None,
            dependencies: Vec::new(),
            spec_context_refs: Vec::new(),
            spec_context_summary: String::new(),
            spec_context_hash: None,
            status: WaypointStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Add an acceptance criterion
    pub fn criterion(mut self, text: impl Into<String>) -> Self {
        self.acceptance_criteria.push(text.into());
        self
    }

    /// Add a dependency on another waypoint
    pub fn depends_on(mut self, waypoint_id: impl Into<String>) -> Self {
        self.dependencies.push(waypoint_id.into());
        self
    }

    /// The exact string the agent must emit to claim completion
    pub fn completion_marker(&self) -> String {
        format!("<waypoint-complete>{}</waypoint-complete>", self.id)
    }

    /// Mark the waypoint complete and stamp the completion time
    pub fn mark_complete(&mut self) {
        self.status = WaypointStatus::Complete;
        self.completed_at = Some(Utc::now());
    }

    /// Load a waypoint from a JSON or YAML file, chosen by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yml" || e == "yaml")
            .unwrap_or(false);
        if is_yaml {
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}
