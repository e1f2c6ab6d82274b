//! Protocol artifacts and the tolerant parser for agent output
//!
//! This module provides:
//! - Typed artifacts (stage reports, clarification request/response)
//! - Tag-family extraction with malformed-block counting
//! - Tool transcript helpers (stdout/stderr/exit code, file operations)
//! - The append-only artifact log

pub mod artifacts;
pub mod trail;
pub mod parser;
pub mod tool_output;

pub use artifacts::{
    ArtifactMeta, ClarificationRequest, ClarificationResponse, ExecutionStage, FlyRole, PROTOCOL_SCHEMA_VERSION,
    ProtocolArtifact, StageFingerprint, StageReport, serialize_artifact,
};
pub use trail::{ArtifactLog, JsonlArtifactLog, MemoryArtifactLog};
pub use parser::{
    CriterionStatus, CriterionVerification, Parsed, ParsedOutput, ValidationEvidence, parse_clarification_payloads,
    parse_criteria, parse_output, parse_stage_reports, parse_validations,
};
pub use tool_output::{
    FileOperation, ValidationCategory, detect_validation_category, extract_file_operation, normalize_command,
    parse_tool_output,
};
