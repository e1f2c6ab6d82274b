//! Bounded, deduplicated clarification exchange.
//!
//! The orchestrator answers clarification requests deterministically from
//! canonical source precedence. No human is ever called from here; running
//! out of rounds is reported back to the loop as an escalation.

use serde_json::{Map, Value};

use crate::fly::escalation::ReasonCode;
use crate::fly::state::LoopState;
use crate::protocol::{
    ArtifactLog, ArtifactMeta, ClarificationRequest, ClarificationResponse, FlyRole, ProtocolArtifact,
    parse_clarification_payloads,
};

pub const MAX_CLARIFICATION_ROUNDS: u32 = 2;

const DEFAULT_OPTION: &str = "Follow docs/product-spec.md and existing repository conventions.";
const RESPONSE_RATIONALE: &str =
    "Canonical source precedence applies: product spec and development covenant override ambiguous secondary hints.";
const RESPONSE_CONSTRAINTS: &[&str] = &[
    "Prefer docs/product-spec.md when requirement wording conflicts.",
    "Escalate again if ambiguity remains after applying this rule.",
];
const RESPONSE_SOURCE_REFS: &[&str] = &["docs/product-spec.md", "AGENTS.md"];

pub const EXHAUSTED_DETAIL: &str = "Clarification rounds exhausted. Escalate to intervention.";
pub const RESOLVED_DETAIL: &str =
    "Clarification resolved by orchestrator guidance; continue with explicit policy constraints.";

/// What happened while processing this turn's requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClarificationOutcome {
    pub requests: Vec<ClarificationRequest>,
    pub responses: Vec<ClarificationResponse>,
    pub exhausted: bool,
}

/// Canonical signature of a payload: its JSON with keys sorted
pub fn payload_signature(payload: &Map<String, Value>) -> String {
    // serde_json maps are BTreeMap-backed, so keys serialize sorted
    Value::Object(payload.clone()).to_string()
}

fn first_string(payload: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Null | Value::String(_) | Value::Bool(false) => None,
            other => Some(other.to_string()),
        })
        .unwrap_or_default()
}

fn confidence(payload: &Map<String, Value>) -> f64 {
    let raw = payload.get("confidence").or_else(|| payload.get("confidence_level"));
    match raw {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn options(payload: &Map<String, Value>) -> Vec<String> {
    let raw = ["options", "requested_options"]
        .iter()
        .filter_map(|k| payload.get(*k))
        .find(|v| v.as_array().is_some_and(|a| !a.is_empty()));
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .filter(|s| !s.trim().is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Build a request artifact from a raw payload, accepting field aliases
pub fn request_from_payload(waypoint_id: &str, payload: &Map<String, Value>) -> ClarificationRequest {
    let mut request = ClarificationRequest::new(
        waypoint_id,
        first_string(payload, &["question", "blocking_question"]),
        first_string(payload, &["context", "decision_context"]),
        confidence(payload),
        options(payload),
    );
    request.meta.source_refs = vec!["execution-output".to_string()];
    request
}

/// Deterministic orchestrator answer
pub fn build_clarification_response(request: &ClarificationRequest) -> ClarificationResponse {
    let chosen_option = request
        .requested_options
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_OPTION.to_string());
    ClarificationResponse {
        meta: ArtifactMeta::new("clarification_response", request.meta.waypoint_id.clone(), FlyRole::Orchestrator)
            .with_source_refs(RESPONSE_SOURCE_REFS.iter().map(|s| s.to_string()).collect()),
        request_artifact_id: request.meta.artifact_id.clone(),
        chosen_option,
        rationale: RESPONSE_RATIONALE.to_string(),
        updated_constraints: RESPONSE_CONSTRAINTS.iter().map(|s| s.to_string()).collect(),
    }
}

fn log_artifact(log: &dyn ArtifactLog, artifact: ProtocolArtifact) {
    if let Err(e) = log.append(&artifact) {
        log::warn!("Failed to log {}: {}", artifact.meta().artifact_type, e);
    }
}

/// Capture new clarification requests from the accumulated output and answer them.
///
/// Requests already seen (by signature) are skipped, so re-scanning the
/// whole output every iteration is safe.
pub fn handle_clarification_requests(
    state: &mut LoopState,
    waypoint_id: &str,
    artifact_log: &dyn ArtifactLog,
) -> ClarificationOutcome {
    let mut outcome = ClarificationOutcome::default();
    let payloads = parse_clarification_payloads(&state.full_output);

    for payload in &payloads.items {
        let signature = payload_signature(payload);
        if !state.clarification.signatures.insert(signature) {
            continue;
        }

        let request = request_from_payload(waypoint_id, payload);
        log::info!(
            "Clarification request for {}: {}",
            waypoint_id,
            request.blocking_question
        );
        log_artifact(artifact_log, ProtocolArtifact::ClarificationRequest(request.clone()));

        state.clarification.rounds += 1;
        state.clarification.unresolved = true;

        if state.clarification.rounds > MAX_CLARIFICATION_ROUNDS {
            log::warn!(
                "Clarification budget exhausted for {} after {} rounds",
                waypoint_id,
                state.clarification.rounds
            );
            state.clarification.exhausted = true;
            state.set_next_reason(ReasonCode::ClarificationBudgetExhausted, EXHAUSTED_DETAIL);
            outcome.exhausted = true;
            outcome.requests.push(request);
            continue;
        }

        let response = build_clarification_response(&request);
        log_artifact(artifact_log, ProtocolArtifact::ClarificationResponse(response.clone()));
        state.clarification.unresolved = false;
        state.set_next_reason(ReasonCode::ClarificationResolved, RESOLVED_DETAIL);
        outcome.requests.push(request);
        outcome.responses.push(response);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MemoryArtifactLog;
    use serde_json::json;

    fn tag(payload: serde_json::Value) -> String {
        format!("<clarification-request>{}</clarification-request>\n", payload)
    }

    #[test]
    fn test_signature_ignores_key_order() {
        let a = json!({"question": "q", "context": "c"});
        let b: Map<String, Value> = serde_json::from_str(r#"{"context":"c","question":"q"}"#).unwrap();
        assert_eq!(payload_signature(a.as_object().unwrap()), payload_signature(&b));
    }

    #[test]
    fn test_request_field_aliases() {
        let payload = json!({
            "blocking_question": "Which DB?",
            "decision_context": "Two options",
            "confidence_level": "0.4",
            "requested_options": ["sqlite", " ", "postgres"],
        });
        let request = request_from_payload("WP-1", payload.as_object().unwrap());
        assert_eq!(request.blocking_question, "Which DB?");
        assert_eq!(request.decision_context, "Two options");
        assert!((request.confidence_level - 0.4).abs() < 1e-9);
        assert_eq!(request.requested_options, vec!["sqlite", "postgres"]);
        assert_eq!(request.meta.source_refs, vec!["execution-output"]);
        assert_eq!(request.meta.produced_by_role, FlyRole::Builder);
    }

    #[test]
    fn test_response_defaults() {
        let request = ClarificationRequest::new("WP-1", "q", "c", 0.5, vec![]);
        let response = build_clarification_response(&request);
        assert_eq!(response.chosen_option, DEFAULT_OPTION);
        assert_eq!(response.request_artifact_id, request.meta.artifact_id);
        assert_eq!(response.meta.produced_by_role, FlyRole::Orchestrator);
        assert_eq!(response.meta.source_refs, vec!["docs/product-spec.md", "AGENTS.md"]);
        assert_eq!(response.updated_constraints.len(), 2);
    }

    #[test]
    fn test_request_answered_and_deduplicated() {
        let log = MemoryArtifactLog::new();
        let mut state = LoopState::new();
        state.full_output = tag(json!({"question": "Which DB?", "options": ["sqlite"]}));

        let outcome = handle_clarification_requests(&mut state, "WP-1", &log);
        assert_eq!(outcome.responses.len(), 1);
        assert_eq!(outcome.responses[0].chosen_option, "sqlite");
        assert_eq!(state.clarification.rounds, 1);
        assert!(!state.clarification.unresolved);
        assert_eq!(state.next_reason_code, ReasonCode::ClarificationResolved);
        assert_eq!(state.next_reason_detail, RESOLVED_DETAIL);

        // Re-scan of the same accumulated output
        let outcome = handle_clarification_requests(&mut state, "WP-1", &log);
        assert!(outcome.requests.is_empty());
        assert_eq!(state.clarification.rounds, 1);
        assert_eq!(log.count_of("clarification_request"), 1);
        assert_eq!(log.count_of("clarification_response"), 1);
    }

    #[test]
    fn test_third_round_exhausts_budget() {
        let log = MemoryArtifactLog::new();
        let mut state = LoopState::new();
        for i in 0..3 {
            state.full_output.push_str(&tag(json!({"question": format!("q{}", i)})));
        }

        let outcome = handle_clarification_requests(&mut state, "WP-1", &log);
        assert!(outcome.exhausted);
        assert_eq!(outcome.requests.len(), 3);
        assert_eq!(outcome.responses.len(), 2);
        assert!(state.clarification.exhausted);
        assert!(state.clarification.unresolved);
        assert_eq!(state.next_reason_code, ReasonCode::ClarificationBudgetExhausted);
        assert_eq!(state.next_reason_detail, EXHAUSTED_DETAIL);
        assert_eq!(log.count_of("clarification_request"), 3);
        assert_eq!(log.count_of("clarification_response"), 2);
    }

    #[test]
    fn test_malformed_payload_ignored() {
        let log = MemoryArtifactLog::new();
        let mut state = LoopState::new();
        state.full_output = "<clarification-request>{oops}</clarification-request>".into();
        let outcome = handle_clarification_requests(&mut state, "WP-1", &log);
        assert_eq!(outcome, ClarificationOutcome::default());
        assert_eq!(state.clarification.rounds, 0);
    }
}
