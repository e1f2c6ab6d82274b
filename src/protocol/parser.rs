//! Tolerant extraction of tagged protocol blocks from free-form agent output.
//!
//! Every scan runs over the whole accumulated output. A block that fails to
//! parse is counted in `ignored_malformed` and the scan moves on; nothing here
//! returns an error.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

use super::artifacts::StageReport;

static STAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<execution-stage>\s*(\{.*?\})\s*</execution-stage>").expect("stage pattern is valid")
});

static CRITERION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<acceptance-criterion>\s*<index>(\d+)</index>\s*<status>(verified|failed)</status>\s*<text>(.*?)</text>\s*<evidence>(.*?)</evidence>\s*</acceptance-criterion>",
    )
    .expect("criterion pattern is valid")
});

static VALIDATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<validation>\s*<command>(.*?)</command>\s*<exit-code>(\d+)</exit-code>\s*<output>(.*?)</output>\s*</validation>",
    )
    .expect("validation pattern is valid")
});

static CLARIFICATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<clarification-request>\s*(\{.*?\})\s*</clarification-request>")
        .expect("clarification pattern is valid")
});

/// Items of one tag family plus the number of blocks that were skipped
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub items: Vec<T>,
    pub ignored_malformed: usize,
}

impl<T> Default for Parsed<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ignored_malformed: 0,
        }
    }
}

/// Status reported for an acceptance criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionStatus {
    Verified,
    Failed,
}

/// Verification of one acceptance criterion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionVerification {
    pub index: usize,
    pub criterion: String,
    pub status: CriterionStatus,
    pub evidence: String,
    pub verified_at: DateTime<Utc>,
}

/// A command the agent says it ran, with its exit code and output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationEvidence {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
}

/// All tag families parsed from one text
#[derive(Debug, Clone, Default)]
pub struct ParsedOutput {
    pub stage_reports: Parsed<StageReport>,
    pub criteria: Parsed<CriterionVerification>,
    pub validations: Parsed<ValidationEvidence>,
    pub clarifications: Parsed<Map<String, Value>>,
}

impl ParsedOutput {
    /// Total malformed blocks across every family
    pub fn ignored_malformed(&self) -> usize {
        self.stage_reports.ignored_malformed
            + self.criteria.ignored_malformed
            + self.validations.ignored_malformed
            + self.clarifications.ignored_malformed
    }
}

/// Parse every tag family
pub fn parse_output(text: &str) -> ParsedOutput {
    ParsedOutput {
        stage_reports: parse_stage_reports(text),
        criteria: parse_criteria(text),
        validations: parse_validations(text),
        clarifications: parse_clarification_payloads(text),
    }
}

/// Opening tags that the strict pattern did not consume
fn unmatched_openings(text: &str, open_tag: &str, matched: usize) -> usize {
    text.matches(open_tag).count().saturating_sub(matched)
}

/// Decode the JSON object inside each match of `re`
fn parse_json_blocks(text: &str, re: &Regex, open_tag: &str) -> Parsed<Map<String, Value>> {
    let mut parsed = Parsed::default();
    let mut matched = 0;
    for caps in re.captures_iter(text) {
        matched += 1;
        let raw = &caps[1];
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => parsed.items.push(map),
            Ok(other) => {
                log::debug!("Skipping {} payload that is not an object: {}", open_tag, other);
                parsed.ignored_malformed += 1;
            }
            Err(e) => {
                log::debug!("Skipping malformed {} payload: {}", open_tag, e);
                parsed.ignored_malformed += 1;
            }
        }
    }
    parsed.ignored_malformed += unmatched_openings(text, open_tag, matched);
    parsed
}

/// Extract `<execution-stage>` reports in order of appearance
pub fn parse_stage_reports(text: &str) -> Parsed<StageReport> {
    let objects = parse_json_blocks(text, &STAGE_RE, "<execution-stage>");
    let mut parsed = Parsed {
        items: Vec::new(),
        ignored_malformed: objects.ignored_malformed,
    };
    for payload in &objects.items {
        match StageReport::from_json(payload) {
            Some(report) => parsed.items.push(report),
            None => parsed.ignored_malformed += 1,
        }
    }
    parsed
}

/// Extract `<acceptance-criterion>` verifications in order of appearance
pub fn parse_criteria(text: &str) -> Parsed<CriterionVerification> {
    let mut parsed = Parsed::default();
    let mut matched = 0;
    for caps in CRITERION_RE.captures_iter(text) {
        matched += 1;
        let Ok(index) = caps[1].parse::<usize>() else {
            parsed.ignored_malformed += 1;
            continue;
        };
        let status = if &caps[2] == "verified" {
            CriterionStatus::Verified
        } else {
            CriterionStatus::Failed
        };
        parsed.items.push(CriterionVerification {
            index,
            criterion: caps[3].trim().to_string(),
            status,
            evidence: caps[4].trim().to_string(),
            verified_at: Utc::now(),
        });
    }
    parsed.ignored_malformed += unmatched_openings(text, "<acceptance-criterion>", matched);
    parsed
}

/// Extract `<validation>` evidence blocks
pub fn parse_validations(text: &str) -> Parsed<ValidationEvidence> {
    let mut parsed = Parsed::default();
    let mut matched = 0;
    for caps in VALIDATION_RE.captures_iter(text) {
        matched += 1;
        let Ok(exit_code) = caps[2].parse::<i32>() else {
            parsed.ignored_malformed += 1;
            continue;
        };
        parsed.items.push(ValidationEvidence {
            command: caps[1].trim().to_string(),
            exit_code,
            output: caps[3].trim().to_string(),
        });
    }
    parsed.ignored_malformed += unmatched_openings(text, "<validation>", matched);
    parsed
}

/// Extract raw `<clarification-request>` payloads; field aliasing happens later
pub fn parse_clarification_payloads(text: &str) -> Parsed<Map<String, Value>> {
    parse_json_blocks(text, &CLARIFICATION_RE, "<clarification-request>")
}
