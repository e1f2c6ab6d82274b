use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use waypoint_fly::agent::DEFAULT_ALLOWED_TOOLS;
use waypoint_fly::fly::ExecutorConfig;
use waypoint_fly::git::GitPolicy;
use waypoint_fly::runtime::{TimeoutDomain, TimeoutOverride, TimeoutPolicyRegistry};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorSection,
    pub git: GitSection,
    /// Per-domain overrides, keyed by domain name (`host_validation`, `git_operation`, ...)
    pub timeouts: HashMap<TimeoutDomain, TimeoutOverride>,
    pub history: HistorySection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub max_iterations: u32,
    pub max_protocol_derailments: u32,
    pub prompt_context_chars: i64,
    pub tool_output_chars: i64,
    pub allowed_tools: Vec<String>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            max_iterations: defaults.max_iterations,
            max_protocol_derailments: defaults.max_protocol_derailments,
            prompt_context_chars: defaults.prompt_context_chars,
            tool_output_chars: defaults.tool_output_chars,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSection {
    pub auto_commit: bool,
    pub auto_init: bool,
    pub run_checklist: bool,
    pub create_waypoint_tags: bool,
}

impl Default for GitSection {
    fn default() -> Self {
        let policy = GitPolicy::default();
        Self {
            auto_commit: policy.auto_commit,
            auto_init: policy.auto_init,
            run_checklist: policy.run_checklist,
            create_waypoint_tags: policy.create_waypoint_tags,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Where timeout history is kept between runs
    pub path: PathBuf,
    pub persist: bool,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(env!("CARGO_PKG_NAME"))
                .join("timeout-history.json"),
            persist: true,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            let config = Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }

        let project_name = env!("CARGO_PKG_NAME");
        let mut candidates = vec![PathBuf::from(format!("{}.yml", project_name))];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join(project_name).join(format!("{}.yml", project_name)));
        }

        for candidate in candidates.iter().filter(|c| c.exists()) {
            match Self::load_from_file(candidate) {
                Ok(config) => {
                    config
                        .validate()
                        .context(format!("Invalid config in {}", candidate.display()))?;
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", candidate.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.max_iterations == 0 {
            bail!("executor.max_iterations must be at least 1");
        }
        if self.executor.max_protocol_derailments == 0 {
            bail!("executor.max_protocol_derailments must be at least 1");
        }
        for (domain, o) in &self.timeouts {
            if let Some(fraction) = o.warning_fraction
                && !(0.0..=1.0).contains(&fraction)
            {
                bail!("timeouts.{}.warning_fraction must be within [0, 1], got {}", domain, fraction);
            }
            if let Some(attempts) = o.max_attempts
                && attempts == 0
            {
                bail!("timeouts.{}.max_attempts must be at least 1", domain);
            }
        }
        Ok(())
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_iterations: self.executor.max_iterations,
            max_protocol_derailments: self.executor.max_protocol_derailments,
            prompt_context_chars: self.executor.prompt_context_chars,
            tool_output_chars: self.executor.tool_output_chars,
            allowed_tools: self.executor.allowed_tools.clone(),
            ..ExecutorConfig::default()
        }
    }

    pub fn git_policy(&self) -> GitPolicy {
        GitPolicy {
            auto_commit: self.git.auto_commit,
            auto_init: self.git.auto_init,
            run_checklist: self.git.run_checklist,
            create_waypoint_tags: self.git.create_waypoint_tags,
        }
    }

    pub fn timeout_registry(&self) -> TimeoutPolicyRegistry {
        TimeoutPolicyRegistry::with_overrides(&self.timeouts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.executor.max_iterations, 10);
        assert_eq!(config.executor.max_protocol_derailments, 2);
        assert!(config.git.auto_commit);
        assert!(config.timeouts.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("waypoint-fly.yml");
        fs::write(
            &path,
            "executor:\n  max_iterations: 3\ngit:\n  create_waypoint_tags: false\ntimeouts:\n  git_operation:\n    default_timeout_seconds: 5\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.executor.max_iterations, 3);
        assert_eq!(config.executor.tool_output_chars, 4000);
        assert!(!config.git_policy().create_waypoint_tags);
        assert!(config.git_policy().auto_init);
        let o = &config.timeouts[&TimeoutDomain::GitOperation];
        assert_eq!(o.default_timeout_seconds, Some(5.0));
    }

    #[test]
    fn test_validate_rejects_zero_iterations() {
        let mut config = Config::default();
        config.executor.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_warning_fraction() {
        let mut config = Config::default();
        config.timeouts.insert(
            TimeoutDomain::HostValidation,
            TimeoutOverride {
                warning_fraction: Some(1.5),
                ..TimeoutOverride::default()
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
