//! Mutable state of one control-loop invocation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::agent::TurnSummary;
use crate::fly::escalation::ReasonCode;
use crate::git::CapturedEvidence;
use crate::protocol::{CriterionStatus, CriterionVerification, FileOperation, StageFingerprint, ValidationCategory};

pub const INITIAL_REASON_DETAIL: &str = "Initial waypoint execution.";

/// Completion as observed by the loop, before the receipt gate runs
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub iteration: u32,
    pub output: String,
    pub criteria: BTreeSet<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClarificationState {
    pub rounds: u32,
    pub signatures: HashSet<String>,
    pub unresolved: bool,
    pub exhausted: bool,
}

/// Running totals over every turn
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cached_tokens_in: u64,
}

impl UsageTotals {
    pub fn add(&mut self, summary: &TurnSummary) {
        self.cost_usd += summary.cost_usd.unwrap_or(0.0);
        self.tokens_in += summary.tokens_in.unwrap_or(0);
        self.tokens_out += summary.tokens_out.unwrap_or(0);
        self.cached_tokens_in += summary.cached_tokens_in.unwrap_or(0);
    }
}

/// Scratch reset at the start of every iteration
#[derive(Debug, Clone, Default)]
pub struct IterationScratch {
    pub output: String,
    pub scope_drift_detected: bool,
    pub stage_reports_logged: usize,
    pub last_tool_name: Option<String>,
    pub last_tool_input: serde_json::Value,
    pub last_tool_output: Option<String>,
    pub file_operations: Vec<FileOperation>,
}

/// Everything the loop accumulates across iterations
#[derive(Debug, Clone)]
pub struct LoopState {
    pub iteration: u32,
    pub full_output: String,
    pub reported_validation_commands: Vec<String>,
    pub captured_criteria: BTreeMap<usize, CriterionVerification>,
    /// Keyed by normalized command
    pub tool_validation_evidence: BTreeMap<String, CapturedEvidence>,
    /// Latest run per category wins
    pub tool_validation_categories: BTreeMap<ValidationCategory, CapturedEvidence>,
    pub logged_stage_reports: HashSet<StageFingerprint>,
    pub completion: Option<CompletionRecord>,
    pub resume_session_id: Option<String>,
    pub next_reason_code: ReasonCode,
    pub next_reason_detail: String,
    pub protocol_derailment_streak: u32,
    pub protocol_derailments: Vec<String>,
    pub clarification: ClarificationState,
    pub usage: UsageTotals,
    pub current: IterationScratch,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            iteration: 0,
            full_output: String::new(),
            reported_validation_commands: Vec::new(),
            captured_criteria: BTreeMap::new(),
            tool_validation_evidence: BTreeMap::new(),
            tool_validation_categories: BTreeMap::new(),
            logged_stage_reports: HashSet::new(),
            completion: None,
            resume_session_id: None,
            next_reason_code: ReasonCode::Initial,
            next_reason_detail: INITIAL_REASON_DETAIL.to_string(),
            protocol_derailment_streak: 0,
            protocol_derailments: Vec::new(),
            clarification: ClarificationState::default(),
            usage: UsageTotals::default(),
            current: IterationScratch::default(),
        }
    }
}

impl LoopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the counter and clear per-iteration scratch
    pub fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.current = IterationScratch::default();
        self.iteration
    }

    pub fn push_text(&mut self, text: &str) {
        self.current.output.push_str(text);
        self.full_output.push_str(text);
    }

    pub fn set_next_reason(&mut self, code: ReasonCode, detail: impl Into<String>) {
        self.next_reason_code = code;
        self.next_reason_detail = detail.into();
    }

    /// Latest status per index wins
    pub fn capture_criterion(&mut self, verification: CriterionVerification) {
        self.captured_criteria.insert(verification.index, verification);
    }

    /// Indices currently reported verified
    pub fn verified_criteria(&self) -> BTreeSet<usize> {
        self.captured_criteria
            .iter()
            .filter(|(_, v)| v.status == CriterionStatus::Verified)
            .map(|(i, _)| *i)
            .collect()
    }

    /// Criterion indices not yet verified
    pub fn unresolved_criteria(&self, criteria_count: usize) -> Vec<usize> {
        let verified = self.verified_criteria();
        (0..criteria_count).filter(|i| !verified.contains(i)).collect()
    }

    /// Returns true the first time a stage report fingerprint is seen
    pub fn record_stage(&mut self, fingerprint: StageFingerprint) -> bool {
        let fresh = self.logged_stage_reports.insert(fingerprint);
        if fresh {
            self.current.stage_reports_logged += 1;
        }
        fresh
    }

    pub fn record_validation_command(&mut self, command: &str) {
        let command = command.trim();
        if !command.is_empty() && !self.reported_validation_commands.iter().any(|c| c == command) {
            self.reported_validation_commands.push(command.to_string());
        }
    }

    pub fn record_derailments(&mut self, issues: &[String]) {
        self.protocol_derailments.extend(issues.iter().cloned());
    }

    /// Validation commands, then tool evidence commands, deduped, first 8
    pub fn useful_commands(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.reported_validation_commands
            .iter()
            .chain(self.tool_validation_evidence.keys())
            .filter(|c| !c.trim().is_empty())
            .filter(|c| seen.insert(c.as_str()))
            .take(8)
            .cloned()
            .collect()
    }
}
