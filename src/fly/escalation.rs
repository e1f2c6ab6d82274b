//! Protocol-drift detection and the escalation decision.
//!
//! Pure functions over one iteration's observations. The control loop owns
//! the derailment streak and feeds it back in on the next call.

use std::collections::BTreeSet;

pub const DEFAULT_MAX_DERAILMENT_STREAK: u32 = 2;

pub const ISSUE_ALIAS_COMPLETION: &str = "claimed completion without exact completion marker";
pub const ISSUE_MISSING_STAGE_REPORT: &str = "missing structured stage report";
pub const ISSUE_SCOPE_DRIFT: &str = "attempted tool access to blocked project areas";

const COMPLETION_ALIAS_HINTS: &[&str] = &[
    "waypoint_complete",
    "waypoint completed",
    "==completed==",
    "implementation is complete",
    "all waypoints",
];

/// Why the next iteration is being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Initial,
    ProtocolViolation,
    IncompleteCriteria,
    ValidationFailure,
    ClarificationResolved,
    ClarificationBudgetExhausted,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::Initial => "initial",
            ReasonCode::ProtocolViolation => "protocol_violation",
            ReasonCode::IncompleteCriteria => "incomplete_criteria",
            ReasonCode::ValidationFailure => "validation_failure",
            ReasonCode::ClarificationResolved => "clarification_resolved",
            ReasonCode::ClarificationBudgetExhausted => "clarification_budget_exhausted",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one iteration looked like, as far as the protocol is concerned
#[derive(Debug, Clone)]
pub struct IterationObservation<'a> {
    pub waypoint_id: &'a str,
    pub iteration_output: &'a str,
    pub completion_marker: &'a str,
    pub stage_reports_logged: usize,
    pub scope_drift_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationDecision {
    pub protocol_issues: Vec<String>,
    pub protocol_derailment_streak: u32,
    pub next_reason_code: ReasonCode,
    pub next_reason_detail: String,
    pub should_escalate: bool,
    pub escalation_summary: Option<String>,
}

/// Recoverable protocol issues in one iteration's output
pub fn detect_protocol_issues(observation: &IterationObservation<'_>) -> Vec<String> {
    let mut issues = Vec::new();
    let lower = observation.iteration_output.to_lowercase();
    let waypoint_alias = format!("{} complete", observation.waypoint_id.to_lowercase());

    let claimed_complete = lower.contains("complete")
        && (COMPLETION_ALIAS_HINTS.iter().any(|hint| lower.contains(hint)) || lower.contains(&waypoint_alias));
    if claimed_complete && !observation.iteration_output.contains(observation.completion_marker) {
        issues.push(ISSUE_ALIAS_COMPLETION.to_string());
    }
    if observation.stage_reports_logged == 0 {
        issues.push(ISSUE_MISSING_STAGE_REPORT.to_string());
    }
    if observation.scope_drift_detected {
        issues.push(ISSUE_SCOPE_DRIFT.to_string());
    }
    issues
}

/// Decide the next reason and whether to hand control to a human.
///
/// A missing stage report is reported but never grows the streak.
pub fn build_escalation_decision(
    observation: &IterationObservation<'_>,
    current_derailment_streak: u32,
    acceptance_criteria: &[String],
    verified_criteria: &BTreeSet<usize>,
    max_derailment_streak: u32,
) -> EscalationDecision {
    let protocol_issues = detect_protocol_issues(observation);

    let (streak, next_reason_code, next_reason_detail) = if !protocol_issues.is_empty() {
        let escalating = protocol_issues.iter().any(|issue| issue != ISSUE_MISSING_STAGE_REPORT);
        let streak = if escalating { current_derailment_streak + 1 } else { 0 };
        (streak, ReasonCode::ProtocolViolation, protocol_issues.join("; "))
    } else {
        let unresolved: Vec<usize> = (0..acceptance_criteria.len())
            .filter(|i| !verified_criteria.contains(i))
            .collect();
        if unresolved.is_empty() {
            (
                0,
                ReasonCode::ValidationFailure,
                "Criteria appear complete, but completion protocol was not satisfied.".to_string(),
            )
        } else {
            let labels = unresolved
                .iter()
                .map(|&i| format!("[{}] {}", i, acceptance_criteria[i]))
                .collect::<Vec<_>>()
                .join(", ");
            (
                0,
                ReasonCode::IncompleteCriteria,
                format!("{} criteria unresolved: {}", unresolved.len(), labels),
            )
        }
    };

    let should_escalate = streak >= max_derailment_streak;
    let escalation_summary = should_escalate
        .then(|| format!("Execution repeatedly violated waypoint protocol. Issues: {}", next_reason_detail));

    if !protocol_issues.is_empty() {
        log::warn!(
            "Protocol issues for {} (streak {}): {}",
            observation.waypoint_id,
            streak,
            next_reason_detail
        );
    }

    EscalationDecision {
        protocol_issues,
        protocol_derailment_streak: streak,
        next_reason_code,
        next_reason_detail,
        should_escalate,
        escalation_summary,
    }
}
