//! Typed protocol artifacts exchanged between the agent and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Version stamped on every artifact this crate produces
pub const PROTOCOL_SCHEMA_VERSION: &str = "1.0";

/// Stage of the builder's inner workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStage {
    Analyze,
    Plan,
    Test,
    Code,
    Run,
    Fix,
    Lint,
    Report,
}

impl ExecutionStage {
    /// Parse a stage name, case-sensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "analyze" => Some(Self::Analyze),
            "plan" => Some(Self::Plan),
            "test" => Some(Self::Test),
            "code" => Some(Self::Code),
            "run" => Some(Self::Run),
            "fix" => Some(Self::Fix),
            "lint" => Some(Self::Lint),
            "report" => Some(Self::Report),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Test => "test",
            Self::Code => "code",
            Self::Run => "run",
            Self::Fix => "fix",
            Self::Lint => "lint",
            Self::Report => "report",
        }
    }
}

/// Structured progress marker emitted inside `<execution-stage>` tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: ExecutionStage,
    pub success: bool,
    pub output: String,
    pub artifacts: Vec<String>,
    pub next_stage: Option<ExecutionStage>,
}

/// Dedup key for a stage report seen in re-scanned output
pub type StageFingerprint = (ExecutionStage, bool, String, Vec<String>, Option<ExecutionStage>);

impl StageReport {
    /// Build from a decoded JSON object. `stage` is required; the rest default.
    pub fn from_json(payload: &serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        let stage = payload.get("stage")?.as_str().and_then(ExecutionStage::parse)?;
        let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
        let output = payload
            .get("output")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let artifacts = payload
            .get("artifacts")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item.as_str() {
                        Some(s) => s.to_string(),
                        None => item.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let next_stage = payload
            .get("next_stage")
            .and_then(|v| v.as_str())
            .and_then(ExecutionStage::parse);

        Some(Self {
            stage,
            success,
            output,
            artifacts,
            next_stage,
        })
    }

    pub fn fingerprint(&self) -> StageFingerprint {
        (
            self.stage,
            self.success,
            self.output.clone(),
            self.artifacts.clone(),
            self.next_stage,
        )
    }
}

/// Who produced an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlyRole {
    Orchestrator,
    Builder,
    Verifier,
    Repair,
}

/// Identity and provenance carried by every artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub schema_version: String,
    pub artifact_id: String,
    pub artifact_type: String,
    pub waypoint_id: String,
    pub produced_by_role: FlyRole,
    pub produced_at: DateTime<Utc>,
    #[serde(default)]
    pub source_refs: Vec<String>,
}

impl ArtifactMeta {
    /// Fresh metadata with a new artifact id and the current time
    pub fn new(artifact_type: impl Into<String>, waypoint_id: impl Into<String>, role: FlyRole) -> Self {
        Self {
            schema_version: PROTOCOL_SCHEMA_VERSION.to_string(),
            artifact_id: Uuid::new_v4().to_string(),
            artifact_type: artifact_type.into(),
            waypoint_id: waypoint_id.into(),
            produced_by_role: role,
            produced_at: Utc::now(),
            source_refs: Vec::new(),
        }
    }

    pub fn with_source_refs(mut self, refs: Vec<String>) -> Self {
        self.source_refs = refs;
        self
    }
}

/// Builder asks the orchestrator to disambiguate something blocking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub blocking_question: String,
    pub decision_context: String,
    pub confidence_level: f64,
    #[serde(default)]
    pub requested_options: Vec<String>,
}

impl ClarificationRequest {
    pub fn new(
        waypoint_id: &str,
        blocking_question: impl Into<String>,
        decision_context: impl Into<String>,
        confidence_level: f64,
        requested_options: Vec<String>,
    ) -> Self {
        Self {
            meta: ArtifactMeta::new("clarification_request", waypoint_id, FlyRole::Builder),
            blocking_question: blocking_question.into(),
            decision_context: decision_context.into(),
            confidence_level,
            requested_options,
        }
    }
}

/// Orchestrator answer to a clarification request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationResponse {
    #[serde(flatten)]
    pub meta: ArtifactMeta,
    pub request_artifact_id: String,
    pub chosen_option: String,
    pub rationale: String,
    #[serde(default)]
    pub updated_constraints: Vec<String>,
}

/// Everything that goes into the append-only protocol trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProtocolArtifact {
    ClarificationRequest(ClarificationRequest),
    ClarificationResponse(ClarificationResponse),
    Stage {
        #[serde(flatten)]
        meta: ArtifactMeta,
        report: StageReport,
    },
    Envelope(crate::fly::envelope::ContextEnvelope),
}

impl ProtocolArtifact {
    pub fn meta(&self) -> &ArtifactMeta {
        match self {
            ProtocolArtifact::ClarificationRequest(r) => &r.meta,
            ProtocolArtifact::ClarificationResponse(r) => &r.meta,
            ProtocolArtifact::Stage { meta, .. } => meta,
            ProtocolArtifact::Envelope(e) => &e.meta,
        }
    }

    /// Wrap a parsed stage report with builder provenance
    pub fn stage(waypoint_id: &str, report: StageReport) -> Self {
        ProtocolArtifact::Stage {
            meta: ArtifactMeta::new("stage_report", waypoint_id, FlyRole::Builder),
            report,
        }
    }
}

/// Compact JSON with sorted keys
pub fn serialize_artifact<T: Serialize>(artifact: &T) -> Result<String> {
    let value = serde_json::to_value(artifact)?;
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_parse_roundtrip_names() {
        for name in ["analyze", "plan", "test", "code", "run", "fix", "lint", "report"] {
            let stage = ExecutionStage::parse(name).unwrap();
            assert_eq!(stage.as_str(), name);
        }
        assert!(ExecutionStage::parse("Analyze").is_none());
        assert!(ExecutionStage::parse("deploy").is_none());
    }

    #[test]
    fn test_stage_report_requires_stage() {
        let payload = json!({"success": true});
        assert!(StageReport::from_json(payload.as_object().unwrap()).is_none());
    }

    #[test]
    fn test_stage_report_defaults() {
        let payload = json!({"stage": "code"});
        let report = StageReport::from_json(payload.as_object().unwrap()).unwrap();
        assert_eq!(report.stage, ExecutionStage::Code);
        assert!(!report.success);
        assert_eq!(report.output, "");
        assert!(report.artifacts.is_empty());
        assert!(report.next_stage.is_none());
    }

    #[test]
    fn test_stage_report_unknown_next_stage_dropped() {
        let payload = json!({"stage": "test", "success": true, "next_stage": "ship"});
        let report = StageReport::from_json(payload.as_object().unwrap()).unwrap();
        assert!(report.next_stage.is_none());
    }

    #[test]
    fn test_artifact_meta_new() {
        let meta = ArtifactMeta::new("clarification_request", "WP-1", FlyRole::Builder);
        assert_eq!(meta.schema_version, "1.0");
        assert_eq!(meta.artifact_id.len(), 36);
        assert!(meta.source_refs.is_empty());
    }

    #[test]
    fn test_serialize_artifact_sorted_compact() {
        let request = ClarificationRequest::new("WP-1", "Which db?", "storage", 0.4, vec!["sqlite".into()]);
        let json = serialize_artifact(&request).unwrap();
        assert!(!json.contains(": "));
        let artifact_id = json.find("\"artifact_id\"").unwrap();
        let waypoint_id = json.find("\"waypoint_id\"").unwrap();
        assert!(artifact_id < waypoint_id);
        assert!(json.contains("\"produced_by_role\":\"builder\""));
    }
}
