//! Intervention types and the table-driven error classifier.
//!
//! Provider errors and agent output are mapped to a small taxonomy of failure
//! kinds. A budget pause is reported as a `reset_at` timestamp; deciding when
//! to resume is left to the caller.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::agent::{AgentError, ProviderErrorKind};
use crate::domain::Waypoint;

/// Why an execution needs a human
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionType {
    IterationLimit,
    TestFailure,
    LintError,
    TypeError,
    ParseError,
    UserRequested,
    ExecutionError,
    RateLimited,
    ApiUnavailable,
    BudgetExceeded,
}

impl InterventionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionType::IterationLimit => "iteration_limit",
            InterventionType::TestFailure => "test_failure",
            InterventionType::LintError => "lint_error",
            InterventionType::TypeError => "type_error",
            InterventionType::ParseError => "parse_error",
            InterventionType::UserRequested => "user_requested",
            InterventionType::ExecutionError => "execution_error",
            InterventionType::RateLimited => "rate_limited",
            InterventionType::ApiUnavailable => "api_unavailable",
            InterventionType::BudgetExceeded => "budget_exceeded",
        }
    }

    pub fn suggested_action(&self) -> InterventionAction {
        match self {
            InterventionType::TestFailure => InterventionAction::Edit,
            InterventionType::UserRequested | InterventionType::BudgetExceeded => InterventionAction::Abort,
            _ => InterventionAction::Retry,
        }
    }
}

impl std::fmt::Display for InterventionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a human can do about it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionAction {
    Retry,
    Skip,
    Edit,
    Rollback,
    Abort,
}

/// Everything a human needs to decide how to proceed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub intervention_type: InterventionType,
    pub waypoint_id: String,
    pub waypoint_title: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub error_summary: String,
    pub suggested_action: InterventionAction,
    /// Budget pause: the earliest time a resume makes sense
    #[serde(default)]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Intervention {
    pub fn new(
        intervention_type: InterventionType,
        waypoint: &Waypoint,
        iteration: u32,
        max_iterations: u32,
        error_summary: impl Into<String>,
    ) -> Self {
        Self {
            intervention_type,
            waypoint_id: waypoint.id.clone(),
            waypoint_title: waypoint.title.clone(),
            iteration,
            max_iterations,
            error_summary: error_summary.into(),
            suggested_action: intervention_type.suggested_action(),
            reset_at: None,
            context: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_reset_at(mut self, reset_at: Option<DateTime<Utc>>) -> Self {
        self.reset_at = reset_at;
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }
}

/// Result of classifying one turn error
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorClassification {
    pub provider_kind: ProviderErrorKind,
    pub intervention_type: InterventionType,
    pub error_summary: String,
    pub reset_at: Option<DateTime<Utc>>,
    /// Reset phrase as written, e.g. "7pm (America/New_York)"
    pub reset_text: Option<String>,
}

/// Ordered phrase table; the first kind with a matching phrase wins
const ERROR_PATTERNS: &[(ProviderErrorKind, &[&str])] = &[
    (
        ProviderErrorKind::BudgetExceeded,
        &[
            "budget",
            "spending limit",
            "billing",
            "credit",
            "quota exceeded",
            "usage limit",
            "daily limit",
            "out of extra usage",
            "out of usage",
            "limit reached",
            "resets",
        ],
    ),
    (
        ProviderErrorKind::RateLimited,
        &["rate limit", "rate_limit", "ratelimit", "429", "too many requests", "throttl"],
    ),
    (
        ProviderErrorKind::Unavailable,
        &[
            "overloaded",
            "503",
            "502",
            "504",
            "unavailable",
            "service error",
            "temporarily",
            "try again later",
            "capacity",
        ],
    ),
];

const USER_INTERVENTION_MARKERS: &[&str] = &[
    "cannot proceed",
    "need human help",
    "blocked by",
    "unable to complete",
    "requires manual",
];

/// Scan text against the phrase table
pub fn classify_text(text: &str) -> ProviderErrorKind {
    let lowered = text.to_lowercase();
    ERROR_PATTERNS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| lowered.contains(p)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ProviderErrorKind::Unknown)
}

/// Kind for an agent error: its variant first, then its message
pub fn classify_agent_error(error: &AgentError) -> ProviderErrorKind {
    match error.structured_kind() {
        ProviderErrorKind::Unknown => classify_text(&error.to_string()),
        kind => kind,
    }
}

/// Classify a turn error, falling back to the accumulated output
pub fn classify_execution_error(error: &AgentError, full_output: &str) -> ErrorClassification {
    classify_execution_error_at(error, full_output, Utc::now())
}

/// `classify_execution_error` with an explicit clock
pub fn classify_execution_error_at(error: &AgentError, full_output: &str, now: DateTime<Utc>) -> ErrorClassification {
    let mut kind = classify_agent_error(error);
    if kind == ProviderErrorKind::Unknown {
        kind = classify_text(full_output);
    }

    let intervention_type = match kind {
        ProviderErrorKind::RateLimited => InterventionType::RateLimited,
        ProviderErrorKind::Unavailable => InterventionType::ApiUnavailable,
        ProviderErrorKind::BudgetExceeded => InterventionType::BudgetExceeded,
        ProviderErrorKind::Unknown => InterventionType::ExecutionError,
    };

    let error_text = error.to_string();
    let reset_text = extract_reset_time(&error_text).or_else(|| extract_reset_time(full_output));
    let reset_at = extract_reset_datetime(&error_text, now).or_else(|| {
        if full_output.is_empty() {
            None
        } else {
            extract_reset_datetime(full_output, now)
        }
    });

    let error_summary = match kind {
        ProviderErrorKind::RateLimited => {
            "Model provider rate limit reached. Wait a few minutes and retry.".to_string()
        }
        ProviderErrorKind::Unavailable => "Model provider temporarily unavailable. Try again shortly.".to_string(),
        ProviderErrorKind::BudgetExceeded => budget_summary(error, reset_text.as_deref()),
        ProviderErrorKind::Unknown => error_text,
    };

    ErrorClassification {
        provider_kind: kind,
        intervention_type,
        error_summary,
        reset_at,
        reset_text,
    }
}

fn budget_summary(error: &AgentError, reset_text: Option<&str>) -> String {
    if let AgentError::BudgetExceeded { limit_usd, current_usd } = error {
        return format!(
            "Configured budget ${:.2} reached (current ${:.2}). Execution paused until you increase the budget.",
            limit_usd, current_usd
        );
    }
    match reset_text {
        Some(text) => format!("Model usage budget exceeded. Resets {}.", text),
        None => "Model usage budget exceeded. Execution paused until budget resets.".to_string(),
    }
}

/// Intervention markers matched case-insensitively against the original text
static USER_INTERVENTION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    USER_INTERVENTION_MARKERS
        .iter()
        .map(|m| Regex::new(&format!("(?i){}", regex::escape(m))).expect("intervention pattern is valid"))
        .collect()
});

/// True when the agent says outright that it needs a human
pub fn needs_user_intervention(output: &str) -> bool {
    USER_INTERVENTION_PATTERNS.iter().any(|re| re.is_match(output))
}

/// Text around the first intervention marker: 100 chars before, 200 after
pub fn extract_intervention_reason(output: &str) -> String {
    for pattern in USER_INTERVENTION_PATTERNS.iter() {
        let Some(found) = pattern.find(output) else {
            continue;
        };
        let chars: Vec<char> = output.chars().collect();
        let idx = output[..found.start()].chars().count();
        let marker_len = found.as_str().chars().count();
        let start = idx.saturating_sub(100);
        let end = (idx + marker_len + 200).min(chars.len());
        let context: String = chars[start..end].iter().collect();
        return format!("Agent indicated: ...{}...", context.trim());
    }
    "Agent requested human intervention".to_string()
}

static RESET_TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)resets?\s+(\d{1,2}(?::\d{2})?\s*(?:am|pm)\s*\([^)]+\))",
        r"(?i)resets?\s+(in\s+\d+\s+(?:hour|minute|second)s?)",
        r"(?i)resets?\s+at\s+(\d{1,2}(?::\d{2})?\s*(?:am|pm)?)",
        r"(?i)resets?\s+(\d{1,2}(?::\d{2})?\s*(?:am|pm))",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("reset pattern is valid"))
    .collect()
});

static RELATIVE_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+in\s+(\d+)\s+(hour|minute|second)s?").expect("relative reset pattern is valid")
});

static ZONED_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(\d{1,2}(?::\d{2})?\s*(?:am|pm))\s*\(([^)]+)\)").expect("zoned reset pattern is valid")
});

static LOCAL_RESET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2}(?::\d{2})?\s*(?:am|pm)?)").expect("local reset pattern is valid")
});

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?::(\d{2}))?(am|pm)?$").expect("clock pattern is valid")
});

/// Reset phrase as written, e.g. "in 2 hours" or "7pm (America/New_York)"
pub fn extract_reset_time(text: &str) -> Option<String> {
    RESET_TEXT_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .map(|caps| caps[1].trim().to_string())
}

/// Reset phrase normalized to an absolute UTC time relative to `now`.
///
/// Zoned times resolve in the named zone (UTC if the name is unknown); bare
/// clock times resolve in the local zone. Both take the next occurrence.
pub fn extract_reset_datetime(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = RELATIVE_RESET_RE.captures(text) {
        return relative_reset(&caps, now);
    }

    if let Some(caps) = ZONED_RESET_RE.captures(text) {
        let clock = parse_clock_time(&caps[1])?;
        let zone_name = caps[2].trim();
        return match zone_name.parse::<Tz>() {
            Ok(tz) => next_occurrence(&tz, clock, now),
            Err(_) => {
                log::debug!("Unknown reset timezone '{}', using UTC", zone_name);
                next_occurrence(&Utc, clock, now)
            }
        };
    }

    if let Some(caps) = LOCAL_RESET_RE.captures(text) {
        let clock = parse_clock_time(&caps[1])?;
        return next_occurrence(&Local, clock, now);
    }

    None
}

fn relative_reset(caps: &Captures<'_>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let quantity: i64 = caps[1].parse().ok()?;
    let delta = match caps[2].to_lowercase().as_str() {
        "hour" => Duration::try_hours(quantity)?,
        "minute" => Duration::try_minutes(quantity)?,
        _ => Duration::try_seconds(quantity)?,
    };
    now.checked_add_signed(delta)
}

/// Parse "7pm", "3:00pm", "15:30" or "15"
fn parse_clock_time(raw: &str) -> Option<NaiveTime> {
    let compact: String = raw.to_lowercase().chars().filter(|c| !c.is_whitespace()).collect();
    let caps = CLOCK_RE.captures(&compact)?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps.get(2).map(|m| m.as_str().parse()).transpose().ok()?.unwrap_or(0);

    match caps.get(3).map(|m| m.as_str()) {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            hour %= 12;
            if meridiem == "pm" {
                hour += 12;
            }
        }
        None if hour > 23 => return None,
        None => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn next_occurrence<Z: TimeZone>(tz: &Z, clock: NaiveTime, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let now_local = now.with_timezone(tz);
    let today = now_local.date_naive();
    for offset in 0..=2 {
        let date = today.checked_add_days(chrono::Days::new(offset))?;
        let Some(candidate) = tz.from_local_datetime(&date.and_time(clock)).earliest() else {
            continue;
        };
        if candidate > now_local {
            return Some(candidate.with_timezone(&Utc));
        }
    }
    None
}
