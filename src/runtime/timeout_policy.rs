//! Domain-scoped timeout, backoff and signal policies.
//!
//! Each timeout domain carries its own defaults. The registry resolves the
//! timeout for a given attempt from the domain default, command-specific
//! floors, a caller override and an optional history hint.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Named category of subprocess execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutDomain {
    /// Checklist commands the host runs to validate a waypoint
    HostValidation,
    /// Shell commands invoked by the agent's Bash tool
    LlmToolBash,
    /// Flight-test harness runs
    FlightTest,
    /// Cheap git probes used for status display
    UiGitProbe,
    /// Git staging, commit, tag and reset
    GitOperation,
}

impl TimeoutDomain {
    pub const ALL: [TimeoutDomain; 5] = [
        TimeoutDomain::HostValidation,
        TimeoutDomain::LlmToolBash,
        TimeoutDomain::FlightTest,
        TimeoutDomain::UiGitProbe,
        TimeoutDomain::GitOperation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutDomain::HostValidation => "host_validation",
            TimeoutDomain::LlmToolBash => "llm_tool_bash",
            TimeoutDomain::FlightTest => "flight_test",
            TimeoutDomain::UiGitProbe => "ui_git_probe",
            TimeoutDomain::GitOperation => "git_operation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.as_str() == value)
    }
}

impl fmt::Display for TimeoutDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How re-attempts after a timeout grow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub multiplier: f64,
    pub max_timeout_seconds: f64,
}

/// How a timed-out process is warned about and stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPolicy {
    /// Fraction of the timeout after which a warning event fires; outside (0, 1) disables it
    pub warning_fraction: f64,
    /// Wait between SIGTERM and SIGKILL
    pub terminate_grace_seconds: f64,
}

/// Complete policy for one domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub domain: TimeoutDomain,
    pub default_timeout_seconds: f64,
    pub min_timeout_seconds: f64,
    pub retry_on_timeout: bool,
    /// Run the command in its own process group and signal the whole group
    pub use_process_group: bool,
    pub backoff: BackoffPolicy,
    pub signal: SignalPolicy,
}

impl TimeoutPolicy {
    /// Built-in defaults for a domain
    pub fn default_for(domain: TimeoutDomain) -> Self {
        type Row = (f64, f64, bool, bool, u32, f64, f64, f64, f64);
        let (default, min, retry, group, attempts, multiplier, max, warn, grace): Row = match domain {
            TimeoutDomain::HostValidation => (300.0, 30.0, true, true, 3, 2.0, 1800.0, 0.75, 15.0),
            TimeoutDomain::LlmToolBash => (120.0, 1.0, false, true, 1, 1.0, 900.0, 0.8, 2.0),
            TimeoutDomain::FlightTest => (180.0, 5.0, false, true, 1, 1.0, 1800.0, 0.8, 10.0),
            TimeoutDomain::UiGitProbe => (5.0, 1.0, false, false, 1, 1.0, 30.0, 0.9, 1.0),
            TimeoutDomain::GitOperation => (30.0, 3.0, false, false, 1, 1.0, 300.0, 0.85, 3.0),
        };
        Self {
            domain,
            default_timeout_seconds: default,
            min_timeout_seconds: min,
            retry_on_timeout: retry,
            use_process_group: group,
            backoff: BackoffPolicy {
                max_attempts: attempts,
                multiplier,
                max_timeout_seconds: max,
            },
            signal: SignalPolicy {
                warning_fraction: warn,
                terminate_grace_seconds: grace,
            },
        }
    }

    /// Apply the fields set in an override
    pub fn apply(&mut self, o: &TimeoutOverride) {
        if let Some(v) = o.default_timeout_seconds {
            self.default_timeout_seconds = v;
        }
        if let Some(v) = o.min_timeout_seconds {
            self.min_timeout_seconds = v;
        }
        if let Some(v) = o.retry_on_timeout {
            self.retry_on_timeout = v;
        }
        if let Some(v) = o.use_process_group {
            self.use_process_group = v;
        }
        if let Some(v) = o.max_attempts {
            self.backoff.max_attempts = v.max(1);
        }
        if let Some(v) = o.multiplier {
            self.backoff.multiplier = v;
        }
        if let Some(v) = o.max_timeout_seconds {
            self.backoff.max_timeout_seconds = v;
        }
        if let Some(v) = o.warning_fraction {
            self.signal.warning_fraction = v;
        }
        if let Some(v) = o.terminate_grace_seconds {
            self.signal.terminate_grace_seconds = v;
        }
    }
}

/// Partial policy read from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutOverride {
    pub default_timeout_seconds: Option<f64>,
    pub min_timeout_seconds: Option<f64>,
    pub retry_on_timeout: Option<bool>,
    pub use_process_group: Option<bool>,
    pub max_attempts: Option<u32>,
    pub multiplier: Option<f64>,
    pub max_timeout_seconds: Option<f64>,
    pub warning_fraction: Option<f64>,
    pub terminate_grace_seconds: Option<f64>,
}

/// What is known about a command when resolving its timeout
#[derive(Debug, Clone, Default)]
pub struct TimeoutContext {
    pub command: String,
    /// Validation category key such as "lint" or "type"
    pub category: Option<String>,
    pub requested_timeout_seconds: Option<f64>,
}

/// Per-domain policies, loaded once per process
#[derive(Debug, Clone)]
pub struct TimeoutPolicyRegistry {
    policies: HashMap<TimeoutDomain, TimeoutPolicy>,
}

impl Default for TimeoutPolicyRegistry {
    fn default() -> Self {
        let policies = TimeoutDomain::ALL
            .into_iter()
            .map(|d| (d, TimeoutPolicy::default_for(d)))
            .collect();
        Self { policies }
    }
}

impl TimeoutPolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults with configuration overrides applied
    pub fn with_overrides(overrides: &HashMap<TimeoutDomain, TimeoutOverride>) -> Self {
        let mut registry = Self::default();
        for (domain, o) in overrides {
            if let Some(policy) = registry.policies.get_mut(domain) {
                policy.apply(o);
            }
        }
        registry
    }

    /// Replace one domain's policy outright
    pub fn set_policy(&mut self, policy: TimeoutPolicy) {
        self.policies.insert(policy.domain, policy);
    }

    pub fn policy_for(&self, domain: TimeoutDomain) -> TimeoutPolicy {
        self.policies
            .get(&domain)
            .cloned()
            .unwrap_or_else(|| TimeoutPolicy::default_for(domain))
    }

    /// Resolve the timeout for a 1-based attempt.
    ///
    /// A caller-requested timeout replaces the contextual base and is only
    /// raised to the domain minimum; backoff still applies on later attempts.
    pub fn timeout_for_attempt(
        &self,
        domain: TimeoutDomain,
        context: &TimeoutContext,
        attempt: u32,
        history_hint_seconds: Option<f64>,
    ) -> f64 {
        let policy = self.policy_for(domain);
        let min = policy.min_timeout_seconds;

        let (base, ceiling) = match context.requested_timeout_seconds {
            Some(requested) => {
                let base = requested.max(min);
                (base, policy.backoff.max_timeout_seconds.max(base))
            }
            None => {
                let mut base = contextual_base_timeout(&policy, context);
                if let Some(hint) = history_hint_seconds {
                    base = base.max(hint);
                }
                (base, policy.backoff.max_timeout_seconds)
            }
        };

        let exponent = attempt.saturating_sub(1) as i32;
        let resolved = base * policy.backoff.multiplier.powi(exponent);
        clamp(resolved, min, ceiling)
    }

    pub fn should_retry_timeout(&self, domain: TimeoutDomain, attempt: u32) -> bool {
        let policy = self.policy_for(domain);
        policy.retry_on_timeout && attempt < policy.backoff.max_attempts
    }

    /// Seconds after which a warning should fire, or `None` when disabled
    pub fn warning_after_seconds(&self, domain: TimeoutDomain, timeout_seconds: f64) -> Option<f64> {
        let fraction = self.policy_for(domain).signal.warning_fraction;
        if fraction <= 0.0 || fraction >= 1.0 {
            return None;
        }
        let warning = timeout_seconds * fraction;
        if warning <= 0.0 || warning >= timeout_seconds {
            return None;
        }
        Some(warning)
    }
}

/// Domain default raised by known slow commands
fn contextual_base_timeout(policy: &TimeoutPolicy, context: &TimeoutContext) -> f64 {
    let mut base = policy.default_timeout_seconds;
    let command = context.command.to_lowercase();

    if policy.domain == TimeoutDomain::HostValidation {
        if command.contains("cargo clippy") {
            base = base.max(900.0);
        } else if command.contains("cargo") {
            base = base.max(600.0);
        } else if context.category.as_deref() == Some("type") {
            base = base.max(420.0);
        }
    }

    clamp(base, policy.min_timeout_seconds, policy.backoff.max_timeout_seconds)
}

fn clamp(value: f64, minimum: f64, maximum: f64) -> f64 {
    minimum.max(value.min(maximum))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(command: &str) -> TimeoutContext {
        TimeoutContext {
            command: command.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_table() {
        let host = TimeoutPolicy::default_for(TimeoutDomain::HostValidation);
        assert_eq!(host.default_timeout_seconds, 300.0);
        assert!(host.retry_on_timeout);
        assert_eq!(host.backoff.max_attempts, 3);

        let probe = TimeoutPolicy::default_for(TimeoutDomain::UiGitProbe);
        assert_eq!(probe.default_timeout_seconds, 5.0);
        assert!(!probe.use_process_group);
    }

    #[test]
    fn test_domain_parse() {
        assert_eq!(TimeoutDomain::parse("git_operation"), Some(TimeoutDomain::GitOperation));
        assert_eq!(TimeoutDomain::parse("nope"), None);
        assert_eq!(TimeoutDomain::LlmToolBash.to_string(), "llm_tool_bash");
    }

    #[test]
    fn test_contextual_floors_for_host_validation() {
        let registry = TimeoutPolicyRegistry::new();
        let d = TimeoutDomain::HostValidation;
        assert_eq!(registry.timeout_for_attempt(d, &ctx("cargo clippy --all"), 1, None), 900.0);
        assert_eq!(registry.timeout_for_attempt(d, &ctx("cargo build"), 1, None), 600.0);
        let typed = TimeoutContext {
            command: "mypy src".into(),
            category: Some("type".into()),
            requested_timeout_seconds: None,
        };
        assert_eq!(registry.timeout_for_attempt(d, &typed, 1, None), 420.0);
        assert_eq!(registry.timeout_for_attempt(d, &ctx("pytest"), 1, None), 300.0);
    }

    #[test]
    fn test_floors_do_not_apply_outside_host_validation() {
        let registry = TimeoutPolicyRegistry::new();
        let t = registry.timeout_for_attempt(TimeoutDomain::LlmToolBash, &ctx("cargo clippy"), 1, None);
        assert_eq!(t, 120.0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let registry = TimeoutPolicyRegistry::new();
        let d = TimeoutDomain::HostValidation;
        let first = registry.timeout_for_attempt(d, &ctx("pytest"), 1, None);
        let second = registry.timeout_for_attempt(d, &ctx("pytest"), 2, None);
        let third = registry.timeout_for_attempt(d, &ctx("pytest"), 3, None);
        assert_eq!((first, second, third), (300.0, 600.0, 1200.0));
        let tenth = registry.timeout_for_attempt(d, &ctx("pytest"), 10, None);
        assert_eq!(tenth, 1800.0);
    }

    #[test]
    fn test_history_hint_raises_base() {
        let registry = TimeoutPolicyRegistry::new();
        let t = registry.timeout_for_attempt(TimeoutDomain::LlmToolBash, &ctx("make"), 1, Some(400.0));
        assert_eq!(t, 400.0);
        let low = registry.timeout_for_attempt(TimeoutDomain::LlmToolBash, &ctx("make"), 1, Some(10.0));
        assert_eq!(low, 120.0);
    }

    #[test]
    fn test_requested_timeout_clamped_to_min_only() {
        let registry = TimeoutPolicyRegistry::new();
        let d = TimeoutDomain::GitOperation;
        let mut context = ctx("git status");
        context.requested_timeout_seconds = Some(0.5);
        assert_eq!(registry.timeout_for_attempt(d, &context, 1, None), 3.0);
        context.requested_timeout_seconds = Some(5000.0);
        assert_eq!(registry.timeout_for_attempt(d, &context, 1, None), 5000.0);
    }

    #[test]
    fn test_should_retry_timeout() {
        let registry = TimeoutPolicyRegistry::new();
        assert!(registry.should_retry_timeout(TimeoutDomain::HostValidation, 1));
        assert!(registry.should_retry_timeout(TimeoutDomain::HostValidation, 2));
        assert!(!registry.should_retry_timeout(TimeoutDomain::HostValidation, 3));
        assert!(!registry.should_retry_timeout(TimeoutDomain::LlmToolBash, 1));
    }

    #[test]
    fn test_warning_after_seconds() {
        let registry = TimeoutPolicyRegistry::new();
        assert_eq!(registry.warning_after_seconds(TimeoutDomain::HostValidation, 100.0), Some(75.0));

        let mut policy = TimeoutPolicy::default_for(TimeoutDomain::FlightTest);
        policy.signal.warning_fraction = 1.0;
        let mut custom = TimeoutPolicyRegistry::new();
        custom.set_policy(policy);
        assert_eq!(custom.warning_after_seconds(TimeoutDomain::FlightTest, 100.0), None);
    }

    #[test]
    fn test_with_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert(
            TimeoutDomain::GitOperation,
            TimeoutOverride {
                default_timeout_seconds: Some(60.0),
                max_attempts: Some(0),
                ..Default::default()
            },
        );
        let registry = TimeoutPolicyRegistry::with_overrides(&overrides);
        let policy = registry.policy_for(TimeoutDomain::GitOperation);
        assert_eq!(policy.default_timeout_seconds, 60.0);
        assert_eq!(policy.backoff.max_attempts, 1);
        assert_eq!(policy.min_timeout_seconds, 3.0);
    }
}
