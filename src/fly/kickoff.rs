//! Compact kickoff prompt for follow-up iterations, and spec-context helpers.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::domain::Waypoint;
use crate::fly::escalation::ReasonCode;

const MAX_REASON_DETAIL_CHARS: usize = 900;
const MAX_SPEC_SUMMARY_CHARS: usize = 700;
const MAX_SECTION_REFS: usize = 8;
const SPEC_HASH_CHARS: usize = 20;

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s+(.+?)\s*$").expect("heading pattern is valid"));

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Short stable hash for spec freshness checks
pub fn compute_spec_hash(spec_text: &str) -> String {
    let digest = Sha256::digest(spec_text.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(SPEC_HASH_CHARS);
    hash
}

/// Lowercased, whitespace-collapsed form used to compare headings
pub fn normalize_section_ref(value: &str) -> String {
    WHITESPACE_RE.replace_all(value.trim(), " ").to_lowercase()
}

/// Markdown heading text in document order, deduplicated loosely
pub fn extract_spec_section_headings(spec_text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    HEADING_RE
        .captures_iter(spec_text)
        .filter_map(|cap| {
            let heading = cap[1].trim().trim_end_matches('#').trim().to_string();
            (!heading.is_empty()).then_some(heading)
        })
        .filter(|heading| seen.insert(normalize_section_ref(heading)))
        .collect()
}

fn truncate_detail(text: &str, max_chars: usize) -> String {
    let stripped = text.trim();
    if stripped.chars().count() <= max_chars {
        return stripped.to_string();
    }
    let prefix: String = stripped.chars().take(max_chars).collect();
    format!("{}... (truncated)", prefix)
}

/// Why the next iteration runs, plus what the loop knows so far
pub struct KickoffInput<'a> {
    pub waypoint: &'a Waypoint,
    pub reason_code: ReasonCode,
    pub reason_detail: &'a str,
    pub verified_criteria: &'a BTreeSet<usize>,
    /// Hash of the product spec as it is on disk now
    pub current_spec_hash: Option<&'a str>,
}

/// Focused prompt for iteration 2 and later
pub fn build_iteration_kickoff_prompt(input: &KickoffInput<'_>) -> String {
    let waypoint = input.waypoint;
    let reason_detail = truncate_detail(input.reason_detail, MAX_REASON_DETAIL_CHARS);

    let mut spec_summary = truncate_detail(&waypoint.spec_context_summary, MAX_SPEC_SUMMARY_CHARS);
    if spec_summary.is_empty() {
        spec_summary = "No chart-time waypoint summary is available.".to_string();
    }

    let section_refs = if waypoint.spec_context_refs.is_empty() {
        "- No section references recorded.".to_string()
    } else {
        waypoint
            .spec_context_refs
            .iter()
            .take(MAX_SECTION_REFS)
            .map(|r| format!("- {}", r))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let unresolved: Vec<String> = waypoint
        .acceptance_criteria
        .iter()
        .enumerate()
        .filter(|(i, _)| !input.verified_criteria.contains(i))
        .map(|(i, text)| format!("- [ ] [{}] {}", i, text))
        .collect();
    let unresolved_block = if unresolved.is_empty() {
        "- All criteria appear verified; finish protocol and validation.".to_string()
    } else {
        unresolved.join("\n")
    };

    let waypoint_hash = waypoint.spec_context_hash.as_deref();
    let stale = matches!((waypoint_hash, input.current_spec_hash), (Some(a), Some(b)) if a != b);

    format!(
        "Iteration kickoff\n\
         Reason: {reason}\n\
         Details: {reason_detail}\n\n\
         Current waypoint: {id} - {title}\n\
         Objective: {objective}\n\n\
         Spec context capsule:\n\
         - Chart-time summary: {spec_summary}\n\
         - Relevant product-spec sections:\n\
         {section_refs}\n\
         - Canonical full spec: docs/product-spec.md\n\
         - waypoint spec hash: {waypoint_hash}\n\
         - current spec hash: {current_hash}\n\
         - Context stale: {stale}\n\n\
         Unresolved criteria:\n\
         {unresolved_block}\n\n\
         Required next action:\n\
         - Continue implementation from current filesystem state.\n\
         - If summary and full spec conflict, follow docs/product-spec.md.\n\
         - Run only necessary validations for changed code.\n\
         - Report structured execution stages.\n\n\
         Completion rule (strict):\n\
         - Emit exactly: {marker}\n\
         - Do not use aliases like WAYPOINT_COMPLETE.\n\
         - Do not re-audit unrelated waypoints.",
        reason = input.reason_code,
        id = waypoint.id,
        title = waypoint.title,
        objective = waypoint.objective,
        waypoint_hash = waypoint_hash.unwrap_or("unknown"),
        current_hash = input.current_spec_hash.unwrap_or("unknown"),
        stale = if stale { "yes" } else { "no" },
        marker = waypoint.completion_marker(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waypoint() -> Waypoint {
        Waypoint::new("WP-2", "Login", "Users can log in")
            .criterion("form renders")
            .criterion("bad password rejected")
    }

    #[test]
    fn test_spec_hash_is_20_hex_chars() {
        let hash = compute_spec_hash("# Spec\n");
        assert_eq!(hash.len(), 20);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, compute_spec_hash("# Spec\n"));
        assert_ne!(hash, compute_spec_hash("# Spec 2\n"));
    }

    #[test]
    fn test_extract_headings_dedup() {
        let spec = "# Overview\ntext\n## Auth ##\n   ### auth\n####### not a heading\n    # indented code\n## Storage\n";
        assert_eq!(extract_spec_section_headings(spec), vec!["Overview", "Auth", "Storage"]);
    }

    #[test]
    fn test_kickoff_lists_unresolved_criteria() {
        let wp = waypoint();
        let verified: BTreeSet<usize> = [0].into_iter().collect();
        let prompt = build_iteration_kickoff_prompt(&KickoffInput {
            waypoint: &wp,
            reason_code: ReasonCode::IncompleteCriteria,
            reason_detail: "1 criteria unresolved: [1] bad password rejected",
            verified_criteria: &verified,
            current_spec_hash: None,
        });
        assert!(prompt.starts_with("Iteration kickoff\nReason: incomplete_criteria\n"));
        assert!(prompt.contains("- [ ] [1] bad password rejected"));
        assert!(!prompt.contains("[0] form renders"));
        assert!(prompt.contains("- Emit exactly: <waypoint-complete>WP-2</waypoint-complete>"));
        assert!(prompt.contains("No chart-time waypoint summary is available."));
        assert!(prompt.contains("- No section references recorded."));
        assert!(prompt.contains("- Context stale: no"));
    }

    #[test]
    fn test_kickoff_all_verified_and_stale() {
        let mut wp = waypoint();
        wp.spec_context_hash = Some("aaaa".into());
        wp.spec_context_refs = (0..10).map(|i| format!("Section {}", i)).collect();
        let verified: BTreeSet<usize> = [0, 1].into_iter().collect();
        let prompt = build_iteration_kickoff_prompt(&KickoffInput {
            waypoint: &wp,
            reason_code: ReasonCode::ValidationFailure,
            reason_detail: "x",
            verified_criteria: &verified,
            current_spec_hash: Some("bbbb"),
        });
        assert!(prompt.contains("- All criteria appear verified; finish protocol and validation."));
        assert!(prompt.contains("- Context stale: yes"));
        assert!(prompt.contains("- Section 7\n"));
        assert!(!prompt.contains("Section 8"));
    }

    #[test]
    fn test_reason_detail_truncated() {
        let wp = waypoint();
        let detail = "d".repeat(1000);
        let prompt = build_iteration_kickoff_prompt(&KickoffInput {
            waypoint: &wp,
            reason_code: ReasonCode::ProtocolViolation,
            reason_detail: &detail,
            verified_criteria: &BTreeSet::new(),
            current_spec_hash: None,
        });
        let expected = format!("Details: {}... (truncated)\n", "d".repeat(900));
        assert!(prompt.contains(&expected));
    }
}
