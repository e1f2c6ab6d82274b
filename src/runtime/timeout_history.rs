//! Rolling per-command duration history that tunes future timeouts.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::timeout_policy::TimeoutDomain;
use crate::error::{FlyError, Result};
use crate::protocol::normalize_command;

/// Samples kept per command key
pub const MAX_SAMPLES_PER_KEY: usize = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyHistory {
    durations: VecDeque<f64>,
    runs: u64,
    timeouts: u64,
}

/// Stats for one command key at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutStatsSnapshot {
    pub key: String,
    pub runs: u64,
    pub timeout_count: u64,
    pub success_count: u64,
    pub max_duration_seconds: f64,
    pub p90_duration_seconds: Option<f64>,
}

/// Shared, thread-safe history of command durations.
///
/// Writers for a given key are expected to be sequential; readers may run
/// concurrently with any writer.
#[derive(Debug)]
pub struct TimeoutHistory {
    max_samples_per_key: usize,
    entries: RwLock<HashMap<String, KeyHistory>>,
    path: Option<PathBuf>,
}

impl Default for TimeoutHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SAMPLES_PER_KEY)
    }

    pub fn with_capacity(max_samples_per_key: usize) -> Self {
        Self {
            max_samples_per_key: max_samples_per_key.max(1),
            entries: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Load persisted history, or start empty if the file does not exist yet.
    /// Later `save()` calls write back to the same path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut history = Self::new();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let mut entries: HashMap<String, KeyHistory> = serde_json::from_str(&content)?;
            for entry in entries.values_mut() {
                while entry.durations.len() > history.max_samples_per_key {
                    entry.durations.pop_front();
                }
            }
            log::debug!("Loaded timeout history for {} keys from {}", entries.len(), path.display());
            history.entries = RwLock::new(entries);
        }
        history.path = Some(path);
        Ok(history)
    }

    /// Persist to the path given to `load()`; a no-op for in-memory history
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let entries = self.entries.read().map_err(|e| FlyError::Storage(e.to_string()))?;
        fs::write(path, serde_json::to_string_pretty(&*entries)?)?;
        Ok(())
    }

    /// Record one attempt
    pub fn record(&self, key: &str, duration_seconds: f64, timed_out: bool) {
        let Ok(mut entries) = self.entries.write() else {
            log::warn!("Timeout history lock poisoned; dropping sample for {}", key);
            return;
        };
        let entry = entries.entry(key.to_string()).or_default();
        entry.runs += 1;
        if timed_out {
            entry.timeouts += 1;
        }
        entry.durations.push_back(duration_seconds.max(0.0));
        while entry.durations.len() > self.max_samples_per_key {
            entry.durations.pop_front();
        }
    }

    /// Observed max duration with headroom, never below `fallback` or above `ceiling`.
    ///
    /// Headroom is 1.5x the observed max plus up to 0.5x more as the timeout rate rises.
    pub fn recommended_timeout_seconds(&self, key: &str, fallback_seconds: f64, ceiling_seconds: f64) -> f64 {
        let Ok(entries) = self.entries.read() else {
            return fallback_seconds;
        };
        let Some(entry) = entries.get(key) else {
            return fallback_seconds;
        };
        if entry.durations.is_empty() {
            return fallback_seconds;
        }

        let observed_max = entry.durations.iter().copied().fold(0.0, f64::max);
        let timeout_rate = if entry.runs > 0 {
            entry.timeouts as f64 / entry.runs as f64
        } else {
            0.0
        };
        let headroom = 1.5 + timeout_rate.min(0.5);
        fallback_seconds.max((observed_max * headroom).min(ceiling_seconds))
    }

    pub fn snapshot(&self, key: &str) -> TimeoutStatsSnapshot {
        let entry = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(key).cloned())
            .unwrap_or_default();

        let mut ordered: Vec<f64> = entry.durations.iter().copied().collect();
        ordered.sort_by(|a, b| a.total_cmp(b));
        let p90 = if ordered.is_empty() {
            None
        } else {
            let index = ((ordered.len() - 1) as f64 * 0.9) as usize;
            Some(ordered[index])
        };

        TimeoutStatsSnapshot {
            key: key.to_string(),
            runs: entry.runs,
            timeout_count: entry.timeouts,
            success_count: entry.runs.saturating_sub(entry.timeouts),
            max_duration_seconds: ordered.last().copied().unwrap_or(0.0),
            p90_duration_seconds: p90,
        }
    }
}

/// History key: `"{domain}|{category or -}|{cwd or -}|{normalized command}"`
pub fn build_command_key(domain: TimeoutDomain, command: &str, category: Option<&str>, cwd: Option<&Path>) -> String {
    let cwd_key = cwd.map(|p| p.display().to_string()).unwrap_or_else(|| "-".to_string());
    format!(
        "{}|{}|{}|{}",
        domain.as_str(),
        category.unwrap_or("-"),
        cwd_key,
        normalize_command(command)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_command_key() {
        let key = build_command_key(TimeoutDomain::HostValidation, " cargo   test ", Some("test"), None);
        assert_eq!(key, "host_validation|test|-|cargo test");
        let key = build_command_key(TimeoutDomain::GitOperation, "git status", None, Some(Path::new("/repo")));
        assert_eq!(key, "git_operation|-|/repo|git status");
    }

    #[test]
    fn test_recommended_falls_back_without_samples() {
        let history = TimeoutHistory::new();
        assert_eq!(history.recommended_timeout_seconds("k", 30.0, 300.0), 30.0);
    }

    #[test]
    fn test_recommended_uses_headroom() {
        let history = TimeoutHistory::new();
        history.record("k", 100.0, false);
        assert_eq!(history.recommended_timeout_seconds("k", 30.0, 300.0), 150.0);

        history.record("k", 100.0, true);
        // timeout rate 0.5 -> headroom 2.0
        assert_eq!(history.recommended_timeout_seconds("k", 30.0, 300.0), 200.0);
        assert_eq!(history.recommended_timeout_seconds("k", 30.0, 120.0), 120.0);
    }

    #[test]
    fn test_ring_is_bounded() {
        let history = TimeoutHistory::with_capacity(3);
        for d in [50.0, 1.0, 2.0, 3.0] {
            history.record("k", d, false);
        }
        let snap = history.snapshot("k");
        assert_eq!(snap.runs, 4);
        assert_eq!(snap.max_duration_seconds, 3.0);
    }

    #[test]
    fn test_snapshot_p90() {
        let history = TimeoutHistory::new();
        for d in 1..=10 {
            history.record("k", d as f64, d == 10);
        }
        let snap = history.snapshot("k");
        assert_eq!(snap.p90_duration_seconds, Some(9.0));
        assert_eq!(snap.timeout_count, 1);
        assert_eq!(snap.success_count, 9);
    }

    #[test]
    fn test_snapshot_unknown_key() {
        let snap = TimeoutHistory::new().snapshot("missing");
        assert_eq!(snap.runs, 0);
        assert!(snap.p90_duration_seconds.is_none());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history").join("timeouts.json");
        {
            let history = TimeoutHistory::load(&path).unwrap();
            history.record("k", 12.0, false);
            history.save().unwrap();
        }
        let reloaded = TimeoutHistory::load(&path).unwrap();
        assert_eq!(reloaded.snapshot("k").runs, 1);
        assert_eq!(reloaded.recommended_timeout_seconds("k", 1.0, 100.0), 18.0);
    }
}
