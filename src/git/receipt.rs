//! Checklist receipts: agent-reported evidence that code verifies before any commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FlyError, Result};
use crate::protocol::{CriterionStatus, CriterionVerification, ValidationCategory};

/// Captured stdout/stderr are truncated to this many chars
pub const MAX_CAPTURED_OUTPUT_CHARS: usize = 2000;

pub const DEFAULT_CHECKLIST: &[&str] = &[
    "Code passes linting",
    "All tests pass",
    "No type errors",
    "Code is properly formatted",
];

/// The waypoint a receipt was produced for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointContext {
    pub title: String,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Passed,
    Failed,
    Skipped,
}

/// One checklist entry with the evidence behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub item: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    /// Why the item was skipped
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

impl ChecklistItem {
    pub fn new(item: impl Into<String>, status: ItemStatus) -> Self {
        Self {
            item: item.into(),
            status,
            command: String::new(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            captured_at: None,
            reason: String::new(),
        }
    }
}

/// Proof of work for one waypoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistReceipt {
    pub waypoint_id: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<WaypointContext>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    /// Advisory items; failures warn but never block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_checklist: Vec<ChecklistItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub criteria_verification: Vec<CriterionVerification>,
}

impl ChecklistReceipt {
    /// All hard items passed or were skipped
    pub fn is_valid(&self) -> bool {
        self.failed_items().is_empty()
    }

    pub fn failed_items(&self) -> Vec<&ChecklistItem> {
        self.checklist
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect()
    }

    pub fn failed_soft_items(&self) -> Vec<&ChecklistItem> {
        self.soft_checklist
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect()
    }

    /// At least one item carries a real exit code rather than prose
    pub fn has_captured_evidence(&self) -> bool {
        self.checklist.iter().any(|i| i.exit_code.is_some())
    }

    pub fn failed_criteria(&self) -> Vec<&CriterionVerification> {
        self.criteria_verification
            .iter()
            .filter(|c| c.status == CriterionStatus::Failed)
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        log::info!("Saved receipt to {}", path.display());
        Ok(())
    }
}

/// Receipt file stem prefix: lowercased id with dashes removed
pub fn safe_receipt_id(waypoint_id: &str) -> String {
    waypoint_id.to_lowercase().replace('-', "")
}

pub fn receipts_dir(project_root: &Path) -> PathBuf {
    project_root.join("receipts")
}

/// Where receipts live and how the latest one is found
pub trait ReceiptStore: Send + Sync {
    fn find_latest_receipt(&self, project_root: &Path, waypoint_id: &str) -> Option<PathBuf>;
}

/// Receipts under `{project}/receipts/{safe_id}-*.json`; newest mtime wins
#[derive(Debug, Clone, Copy, Default)]
pub struct FsReceiptStore;

impl FsReceiptStore {
    /// Path for a new receipt written now
    pub fn receipt_path(project_root: &Path, waypoint_id: &str, at: DateTime<Utc>) -> PathBuf {
        receipts_dir(project_root).join(format!(
            "{}-{}.json",
            safe_receipt_id(waypoint_id),
            at.format("%Y%m%d-%H%M%S%3f")
        ))
    }
}

impl ReceiptStore for FsReceiptStore {
    fn find_latest_receipt(&self, project_root: &Path, waypoint_id: &str) -> Option<PathBuf> {
        let dir = receipts_dir(project_root);
        if !dir.is_dir() {
            return None;
        }
        let pattern = dir.join(format!("{}-*.json", safe_receipt_id(waypoint_id)));
        let entries = glob::glob(&pattern.to_string_lossy()).ok()?;
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|path| {
                let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((mtime, path))
            })
            .max_by(|(a, pa), (b, pb)| a.cmp(b).then_with(|| pa.cmp(pb)))
            .map(|(_, path)| path)
    }
}

/// Outcome of validating a receipt
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiptValidationResult {
    pub valid: bool,
    pub message: String,
    /// Blocking failures and advisory warnings
    pub reasons: Vec<String>,
    pub receipt: Option<ChecklistReceipt>,
}

impl ReceiptValidationResult {
    fn invalid(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            valid: false,
            reasons: vec![message.clone()],
            message,
            receipt: None,
        }
    }
}

/// Checks a receipt independently of whatever the agent claimed
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiptValidator;

impl ReceiptValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, receipt_path: Option<&Path>, waypoint_id: &str) -> ReceiptValidationResult {
        let Some(path) = receipt_path.filter(|p| p.exists()) else {
            log::warn!("Receipt not found for {}", waypoint_id);
            return ReceiptValidationResult::invalid("No receipt found - model did not produce checklist evidence");
        };

        let receipt = match ChecklistReceipt::load(path) {
            Ok(receipt) => receipt,
            Err(e) => {
                log::error!("Invalid receipt format: {} - {}", path.display(), e);
                return ReceiptValidationResult::invalid(format!("Receipt is malformed: {}", e));
            }
        };

        if receipt.waypoint_id != waypoint_id {
            let mut result = ReceiptValidationResult::invalid(format!(
                "Receipt waypoint mismatch: expected {}, found {}",
                waypoint_id, receipt.waypoint_id
            ));
            result.receipt = Some(receipt);
            return result;
        }

        let failed = receipt.failed_items();
        if !failed.is_empty() {
            let names = failed.iter().map(|i| i.item.as_str()).collect::<Vec<_>>().join(", ");
            log::warn!("Checklist failed: {}", names);
            let mut reasons: Vec<String> = failed.iter().map(|i| format!("Failed: {}", i.item)).collect();
            reasons.extend(soft_warnings(&receipt));
            return ReceiptValidationResult {
                valid: false,
                message: format!("Checklist failed: {}", names),
                reasons,
                receipt: Some(receipt),
            };
        }

        let reasons = soft_warnings(&receipt);
        for reason in &reasons {
            log::warn!("{}", reason);
        }
        log::info!("Receipt validated: {}", path.display());
        ReceiptValidationResult {
            valid: true,
            message: "Receipt validated successfully".to_string(),
            reasons,
            receipt: Some(receipt),
        }
    }
}

/// Advisory reasons: failed soft items and criteria the agent marked failed
fn soft_warnings(receipt: &ChecklistReceipt) -> Vec<String> {
    let soft = receipt
        .failed_soft_items()
        .into_iter()
        .map(|i| format!("Soft check failed: {}", i.item));
    let criteria = receipt
        .failed_criteria()
        .into_iter()
        .map(|c| format!("Criterion failed: [{}] {}", c.index, c.criterion));
    soft.chain(criteria).collect()
}

/// Output of one validation command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvidence {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub captured_at: DateTime<Utc>,
}

/// Builds a receipt from evidence code captured during execution
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    waypoint_id: String,
    context: WaypointContext,
    evidence: BTreeMap<String, CapturedEvidence>,
    criteria: BTreeMap<usize, CriterionVerification>,
}

impl ReceiptBuilder {
    pub fn new(waypoint_id: &str, title: &str, objective: &str, acceptance_criteria: Vec<String>) -> Self {
        Self {
            waypoint_id: waypoint_id.to_string(),
            context: WaypointContext {
                title: title.to_string(),
                objective: objective.to_string(),
                acceptance_criteria,
            },
            evidence: BTreeMap::new(),
            criteria: BTreeMap::new(),
        }
    }

    /// Latest evidence per category wins
    pub fn capture(&mut self, category: ValidationCategory, evidence: CapturedEvidence) {
        log::debug!("Captured evidence for {}: exit_code={}", category.key(), evidence.exit_code);
        self.evidence.insert(category.key().to_string(), evidence);
    }

    pub fn capture_criterion(&mut self, verification: CriterionVerification) {
        self.criteria.insert(verification.index, verification);
    }

    pub fn has_evidence(&self) -> bool {
        !self.evidence.is_empty()
    }

    pub fn build(&self) -> ChecklistReceipt {
        let checklist = self
            .evidence
            .iter()
            .map(|(category, ev)| ChecklistItem {
                item: category.clone(),
                status: if ev.exit_code == 0 {
                    ItemStatus::Passed
                } else {
                    ItemStatus::Failed
                },
                command: ev.command.clone(),
                exit_code: Some(ev.exit_code),
                stdout: truncate_chars(&ev.stdout, MAX_CAPTURED_OUTPUT_CHARS),
                stderr: truncate_chars(&ev.stderr, MAX_CAPTURED_OUTPUT_CHARS),
                captured_at: Some(ev.captured_at),
                reason: String::new(),
            })
            .collect();

        ChecklistReceipt {
            waypoint_id: self.waypoint_id.clone(),
            completed_at: Utc::now(),
            context: Some(self.context.clone()),
            checklist,
            soft_checklist: Vec::new(),
            criteria_verification: self.criteria.values().cloned().collect(),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ChecklistFile {
    #[serde(default)]
    checklist: Option<Vec<String>>,
    #[serde(default)]
    validation: Option<ValidationSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ValidationSection {
    #[serde(default)]
    commands: BTreeMap<String, String>,
}

/// Project checklist stored at `{project}/checklist.yaml`
#[derive(Debug, Clone, PartialEq)]
pub struct Checklist {
    pub items: Vec<String>,
    /// Command overrides by category key, e.g. `lint -> "cargo clippy"`
    pub validation_overrides: BTreeMap<String, String>,
}

impl Default for Checklist {
    fn default() -> Self {
        Self {
            items: DEFAULT_CHECKLIST.iter().map(|s| s.to_string()).collect(),
            validation_overrides: BTreeMap::new(),
        }
    }
}

impl Checklist {
    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join("checklist.yaml")
    }

    /// Load the project checklist; missing or malformed files yield the defaults
    pub fn load(project_root: &Path) -> Self {
        let path = Self::path(project_root);
        if !path.exists() {
            return Self::default();
        }
        match Self::read(&path) {
            Ok(checklist) => {
                log::debug!(
                    "Loaded checklist from {}: {} items, {} overrides",
                    path.display(),
                    checklist.items.len(),
                    checklist.validation_overrides.len()
                );
                checklist
            }
            Err(e) => {
                log::warn!("Failed to load checklist from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let file: Option<ChecklistFile> = serde_yaml::from_str(&content)?;
        let file = file.ok_or_else(|| FlyError::Config("Checklist file is empty".to_string()))?;
        Ok(Self {
            items: file
                .checklist
                .unwrap_or_else(|| DEFAULT_CHECKLIST.iter().map(|s| s.to_string()).collect()),
            validation_overrides: file.validation.map(|v| v.commands).unwrap_or_default(),
        })
    }

    pub fn save(&self, project_root: &Path) -> Result<()> {
        let file = ChecklistFile {
            checklist: Some(self.items.clone()),
            validation: (!self.validation_overrides.is_empty()).then(|| ValidationSection {
                commands: self.validation_overrides.clone(),
            }),
        };
        fs::create_dir_all(project_root)?;
        fs::write(Self::path(project_root), serde_yaml::to_string(&file)?)?;
        Ok(())
    }

    pub fn override_for(&self, category: ValidationCategory) -> Option<&str> {
        self.validation_overrides.get(category.key()).map(String::as_str)
    }

    /// Checklist section of the execution prompt
    pub fn to_prompt(&self) -> String {
        let items = self
            .items
            .iter()
            .map(|i| format!("- {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!("Before marking this waypoint complete, verify the following:\n\n{}\n", items);
        if !self.validation_overrides.is_empty() {
            prompt.push_str("\nUse these project validation commands:\n");
            for (category, command) in &self.validation_overrides {
                prompt.push_str(&format!("- {}: {}\n", category, command));
            }
        }
        prompt.push_str(
            "\nReport each validation you run with a <validation> block containing the \
             command, its exit code and its output. The receipt is built from the commands \
             you actually run.\n",
        );
        prompt
    }
}
