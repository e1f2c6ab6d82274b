//! Durable per-waypoint memory for later waypoints.
//!
//! Each run leaves a small JSON record under `.waypoints/memory/`. Later
//! waypoints get a bounded summary of dependency records (and lexically
//! related ones) through the waypoint-memory context slice.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::domain::Waypoint;
use crate::error::Result;
use crate::fly::state::LoopState;

pub const WAYPOINT_MEMORY_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MEMORY_CONTEXT_CHARS: usize = 2400;
pub const MAX_CONTEXT_RECORDS: usize = 4;
const MAX_DERAILMENTS: usize = 8;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-z0-9_]{3,}").expect("token pattern is valid"));

const STOPWORDS: &[&str] = &[
    "the", "and", "with", "for", "from", "that", "this", "into", "use", "waypoint", "implement",
];

/// What one waypoint run left behind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointMemoryRecord {
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    pub waypoint_id: String,
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub result: String,
    pub iterations_used: u32,
    pub max_iterations: u32,
    #[serde(default)]
    pub protocol_derailments: Vec<String>,
    #[serde(default)]
    pub error_summary: Option<String>,
    #[serde(default)]
    pub validation_commands: Vec<String>,
    #[serde(default)]
    pub useful_commands: Vec<String>,
    #[serde(default)]
    pub verified_criteria: Vec<usize>,
}

impl WaypointMemoryRecord {
    /// Summarize a finished loop
    pub fn from_run(
        waypoint: &Waypoint,
        state: &LoopState,
        result: &str,
        max_iterations: u32,
        error_summary: Option<String>,
    ) -> Self {
        let derailments = &state.protocol_derailments;
        let start = derailments.len().saturating_sub(MAX_DERAILMENTS);
        Self {
            schema_version: WAYPOINT_MEMORY_SCHEMA_VERSION,
            saved_at: Utc::now(),
            waypoint_id: waypoint.id.clone(),
            title: waypoint.title.clone(),
            objective: waypoint.objective.clone(),
            dependencies: waypoint.dependencies.clone(),
            result: result.to_string(),
            iterations_used: state.iteration,
            max_iterations,
            protocol_derailments: derailments[start..].to_vec(),
            error_summary,
            validation_commands: state.reported_validation_commands.clone(),
            useful_commands: state.useful_commands(),
            verified_criteria: state.verified_criteria().into_iter().collect(),
        }
    }
}

pub fn waypoint_memory_dir(project_root: &Path) -> PathBuf {
    project_root.join(".waypoints").join("memory")
}

pub fn waypoint_memory_path(project_root: &Path, waypoint_id: &str) -> PathBuf {
    waypoint_memory_dir(project_root).join(format!("{}.json", waypoint_id))
}

pub fn save_waypoint_memory(project_root: &Path, record: &WaypointMemoryRecord) -> Result<PathBuf> {
    let path = waypoint_memory_path(project_root, &record.waypoint_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_string_pretty(record)? + "\n")?;
    Ok(path)
}

/// Persist memory for a finished run; failures are logged, never raised
pub fn persist_waypoint_memory(
    project_root: &Path,
    waypoint: &Waypoint,
    state: &LoopState,
    result: &str,
    max_iterations: u32,
    error_summary: Option<String>,
) {
    let record = WaypointMemoryRecord::from_run(waypoint, state, result, max_iterations, error_summary);
    match save_waypoint_memory(project_root, &record) {
        Ok(path) => log::debug!("Saved waypoint memory to {}", path.display()),
        Err(e) => log::warn!("Failed to persist waypoint memory for {}: {}", waypoint.id, e),
    }
}

pub fn load_waypoint_memory(project_root: &Path, waypoint_id: &str) -> Option<WaypointMemoryRecord> {
    let content = fs::read_to_string(waypoint_memory_path(project_root, waypoint_id)).ok()?;
    serde_json::from_str(&content).ok()
}

fn load_all(project_root: &Path) -> Vec<WaypointMemoryRecord> {
    let pattern = waypoint_memory_dir(project_root).join("*.json");
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = paths.filter_map(|p| p.ok()).collect();
    paths.sort();
    paths
        .iter()
        .filter_map(|path| {
            let content = fs::read_to_string(path).ok()?;
            match serde_json::from_str(&content) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::debug!("Skipping unreadable memory {}: {}", path.display(), e);
                    None
                }
            }
        })
        .collect()
}

fn tokenize(text: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn lexical_similarity(record: &WaypointMemoryRecord, waypoint: &Waypoint) -> usize {
    let current = tokenize(&format!("{} {}", waypoint.title, waypoint.objective));
    let remembered = tokenize(&format!("{} {}", record.title, record.objective));
    current.intersection(&remembered).count()
}

/// Dependencies first (newest first), then the most similar other records
fn select_relevant(project_root: &Path, waypoint: &Waypoint, max_records: usize) -> Vec<WaypointMemoryRecord> {
    let all = load_all(project_root);
    let (mut dependencies, others): (Vec<_>, Vec<_>) = all
        .into_iter()
        .filter(|r| r.waypoint_id != waypoint.id)
        .partition(|r| waypoint.dependencies.contains(&r.waypoint_id));

    dependencies.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
    let mut ranked: Vec<(usize, WaypointMemoryRecord)> =
        others.into_iter().map(|r| (lexical_similarity(&r, waypoint), r)).collect();
    ranked.sort_by(|(sa, a), (sb, b)| sb.cmp(sa).then_with(|| b.saved_at.cmp(&a.saved_at)));

    dependencies
        .into_iter()
        .chain(ranked.into_iter().map(|(_, r)| r))
        .take(max_records)
        .collect()
}

/// Render prior waypoint memory for the waypoint-memory context slice.
///
/// Returns an empty string when nothing relevant is stored.
pub fn load_waypoint_memory_context(project_root: &Path, waypoint: &Waypoint, max_chars: usize) -> String {
    let records = select_relevant(project_root, waypoint, MAX_CONTEXT_RECORDS);
    if records.is_empty() {
        return String::new();
    }

    let mut lines = vec!["Use the following prior waypoint memory as guidance (not as hard constraints):".to_string()];
    for record in &records {
        let relation = if waypoint.dependencies.contains(&record.waypoint_id) {
            "dependency"
        } else {
            "recent"
        };
        lines.push(format!(
            "- {} ({}, result={}, iterations={}/{})",
            record.waypoint_id, relation, record.result, record.iterations_used, record.max_iterations
        ));
        if !record.validation_commands.is_empty() {
            let commands: Vec<&str> = record.validation_commands.iter().take(4).map(String::as_str).collect();
            lines.push(format!("  validations: {}", commands.join("; ")));
        }
        if !record.protocol_derailments.is_empty() {
            let pitfalls: Vec<&str> = record.protocol_derailments.iter().take(2).map(String::as_str).collect();
            lines.push(format!("  pitfalls: {}", pitfalls.join("; ")));
        }
        if let Some(summary) = &record.error_summary {
            lines.push(format!("  caution: {}", summary));
        }
    }

    let content = lines.join("\n");
    if content.chars().count() <= max_chars {
        return content;
    }
    let clipped: String = content.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", clipped.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(id: &str, title: &str, age_minutes: i64) -> WaypointMemoryRecord {
        WaypointMemoryRecord {
            schema_version: WAYPOINT_MEMORY_SCHEMA_VERSION,
            saved_at: Utc::now() - Duration::minutes(age_minutes),
            waypoint_id: id.to_string(),
            title: title.to_string(),
            objective: String::new(),
            dependencies: vec![],
            result: "success".into(),
            iterations_used: 2,
            max_iterations: 10,
            protocol_derailments: vec![],
            error_summary: None,
            validation_commands: vec!["cargo test".into()],
            useful_commands: vec![],
            verified_criteria: vec![0],
        }
    }

    #[test]
    fn test_from_run_keeps_last_derailments() {
        let wp = Waypoint::new("WP-1", "T", "O");
        let mut state = LoopState::new();
        state.iteration = 3;
        state.protocol_derailments = (0..12).map(|i| format!("d{}", i)).collect();
        state.record_validation_command("cargo test");
        let rec = WaypointMemoryRecord::from_run(&wp, &state, "max_iterations", 10, Some("stuck".into()));
        assert_eq!(rec.protocol_derailments.len(), 8);
        assert_eq!(rec.protocol_derailments[0], "d4");
        assert_eq!(rec.iterations_used, 3);
        assert_eq!(rec.useful_commands, vec!["cargo test"]);
        assert_eq!(rec.schema_version, 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let rec = record("WP-1", "Auth", 0);
        let path = save_waypoint_memory(dir.path(), &rec).unwrap();
        assert_eq!(path, dir.path().join(".waypoints/memory/WP-1.json"));
        assert_eq!(load_waypoint_memory(dir.path(), "WP-1"), Some(rec));
        assert!(load_waypoint_memory(dir.path(), "WP-9").is_none());
    }

    #[test]
    fn test_context_prefers_dependencies() {
        let dir = TempDir::new().unwrap();
        save_waypoint_memory(dir.path(), &record("WP-1", "Database schema", 30)).unwrap();
        save_waypoint_memory(dir.path(), &record("WP-2", "Login form", 10)).unwrap();
        let mut failed = record("WP-3", "Unrelated export", 5);
        failed.error_summary = Some("rate limited".into());
        save_waypoint_memory(dir.path(), &failed).unwrap();

        let wp = Waypoint::new("WP-4", "Login session", "Persist login").depends_on("WP-1");
        let context = load_waypoint_memory_context(dir.path(), &wp, DEFAULT_MEMORY_CONTEXT_CHARS);
        let lines: Vec<&str> = context.lines().collect();
        assert!(lines[1].starts_with("- WP-1 (dependency, result=success, iterations=2/10)"));
        assert!(lines[2].contains("validations: cargo test"));
        assert!(lines[3].starts_with("- WP-2 (recent"));
        assert!(context.contains("caution: rate limited"));
    }

    #[test]
    fn test_context_excludes_self_and_bounds_length() {
        let dir = TempDir::new().unwrap();
        save_waypoint_memory(dir.path(), &record("WP-1", "Self", 0)).unwrap();
        let wp = Waypoint::new("WP-1", "Self", "o");
        assert_eq!(load_waypoint_memory_context(dir.path(), &wp, 100), "");

        save_waypoint_memory(dir.path(), &record("WP-2", "Other", 0)).unwrap();
        let context = load_waypoint_memory_context(dir.path(), &wp, 40);
        assert!(context.chars().count() <= 40);
        assert!(context.ends_with("..."));
    }

    #[test]
    fn test_tokenize_drops_stopwords() {
        let tokens = tokenize("Implement the login waypoint for users");
        assert!(tokens.contains("login"));
        assert!(tokens.contains("users"));
        assert!(!tokens.contains("the"));
        assert!(!tokens.contains("implement"));
    }
}
