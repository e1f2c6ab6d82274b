//! Waypoint executor - the iterative control loop.
//!
//! Each iteration builds a fresh prompt (the full execution prompt first,
//! a compact kickoff afterwards), runs one agent turn, then decides from the
//! accumulated protocol output whether the waypoint is done, needs another
//! pass, or has to be handed to a human.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::agent::{AgentClient, AgentEvent, AgentRequest, DEFAULT_ALLOWED_TOOLS};
use crate::domain::{
    CancelSignal, ExecutionContext, ExecutionResult, ExecutionState, ExecutionStep, NoOpCancelSignal, ProgressSender,
    Waypoint, WaypointStatus,
};
use crate::error::Result;
use crate::fly::clarification::{EXHAUSTED_DETAIL, handle_clarification_requests};
use crate::fly::envelope::{
    DIRECTORY_POLICY_SLICE, WAYPOINT_MEMORY_SLICE, apply_context_envelope, clip_tool_output_for_context,
};
use crate::fly::escalation::{DEFAULT_MAX_DERAILMENT_STREAK, IterationObservation, build_escalation_decision};
use crate::fly::intervention::{
    Intervention, InterventionType, classify_execution_error, extract_intervention_reason, needs_user_intervention,
};
use crate::fly::kickoff::{KickoffInput, build_iteration_kickoff_prompt, compute_spec_hash};
use crate::fly::memory::{DEFAULT_MEMORY_CONTEXT_CHARS, load_waypoint_memory_context, persist_waypoint_memory};
use crate::fly::prompts::{build_execution_prompt, build_system_prompt};
use crate::fly::scope::{DirectoryPolicy, scope_violations};
use crate::fly::state::{CompletionRecord, LoopState, UsageTotals};
use crate::git::{CapturedEvidence, Checklist, FsReceiptStore, ReceiptBuilder};
use crate::protocol::{
    ArtifactLog, FlyRole, MemoryArtifactLog, ProtocolArtifact, detect_validation_category, extract_file_operation,
    normalize_command, parse_output, parse_tool_output, parse_validations,
};

/// Buffer between the agent and the event drain
const AGENT_EVENT_BUFFER: usize = 64;

/// Configuration for the WaypointExecutor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Iteration budget per waypoint
    pub max_iterations: u32,
    /// Escalating derailment streak that hands control to a human
    pub max_protocol_derailments: u32,
    /// Budget for policy and memory context injected into each turn
    pub prompt_context_chars: i64,
    /// Budget for the last tool output kept in loop state
    pub tool_output_chars: i64,
    pub allowed_tools: Vec<String>,
    /// Write a receipt from captured evidence on success
    pub write_receipt: bool,
    /// Save a memory record for every finished run
    pub persist_memory: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_protocol_derailments: DEFAULT_MAX_DERAILMENT_STREAK,
            prompt_context_chars: 6000,
            tool_output_chars: 4000,
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|t| t.to_string()).collect(),
            write_receipt: true,
            persist_memory: true,
        }
    }
}

/// What one `execute` call produced
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    pub iterations: u32,
    pub usage: UsageTotals,
    /// Receipt written from captured evidence, if any
    pub receipt_path: Option<PathBuf>,
    /// Protocol tags that were present but could not be decoded
    pub ignored_malformed: usize,
    pub state: LoopState,
}

/// Drives one waypoint to a terminal outcome.
pub struct WaypointExecutor<A>
where
    A: AgentClient,
{
    agent: Arc<A>,
    project_root: PathBuf,
    /// Full product spec text
    spec: String,
    config: ExecutorConfig,
    artifact_log: Arc<dyn ArtifactLog>,
    cancel: Arc<dyn CancelSignal>,
    progress: Option<ProgressSender>,
    state: ExecutionState,
}

impl<A> WaypointExecutor<A>
where
    A: AgentClient,
{
    /// Create a new executor with default configuration.
    pub fn new(agent: Arc<A>, project_root: impl Into<PathBuf>, spec: impl Into<String>) -> Self {
        Self::with_config(agent, project_root, spec, ExecutorConfig::default())
    }

    /// Create a new executor with custom configuration.
    pub fn with_config(
        agent: Arc<A>,
        project_root: impl Into<PathBuf>,
        spec: impl Into<String>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            agent,
            project_root: project_root.into(),
            spec: spec.into(),
            config,
            artifact_log: Arc::new(MemoryArtifactLog::new()),
            cancel: Arc::new(NoOpCancelSignal),
            progress: None,
            state: ExecutionState::Idle,
        }
    }

    pub fn with_artifact_log(mut self, artifact_log: Arc<dyn ArtifactLog>) -> Self {
        self.artifact_log = artifact_log;
        self
    }

    pub fn with_cancel_signal(mut self, cancel: Arc<dyn CancelSignal>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn transition(&mut self, next: ExecutionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            log::debug!("Ignoring executor transition {:?} -> {:?}", self.state, next);
            return;
        }
        log::debug!("Executor state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn emit(&self, waypoint_id: &str, state: &LoopState, step: ExecutionStep, output: impl Into<String>) {
        self.emit_with_files(waypoint_id, state, step, output, Vec::new());
    }

    fn emit_with_files(
        &self,
        waypoint_id: &str,
        state: &LoopState,
        step: ExecutionStep,
        output: impl Into<String>,
        file_operations: Vec<crate::protocol::FileOperation>,
    ) {
        let Some(progress) = &self.progress else {
            return;
        };
        let event = ExecutionContext {
            waypoint_id: waypoint_id.to_string(),
            step,
            iteration: state.iteration,
            total_iterations: self.config.max_iterations,
            output: output.into(),
            criteria_completed: state.verified_criteria(),
            file_operations,
        };
        // A dropped receiver only means nobody is watching
        let _ = progress.send(event);
    }

    fn log_artifact(&self, artifact: ProtocolArtifact) {
        if let Err(e) = self.artifact_log.append(&artifact) {
            log::warn!("Failed to log {} artifact: {}", artifact.meta().artifact_type, e);
        }
    }

    fn intervention(
        &self,
        kind: InterventionType,
        waypoint: &Waypoint,
        state: &LoopState,
        summary: impl Into<String>,
    ) -> Intervention {
        Intervention::new(kind, waypoint, state.iteration, self.config.max_iterations, summary)
    }

    /// Run the control loop until the waypoint reaches a terminal outcome.
    ///
    /// On success the waypoint stays `InProgress`. The receipt gate marks it
    /// complete once the receipt validates.
    pub async fn execute(&mut self, waypoint: &mut Waypoint) -> Result<ExecutionReport> {
        if self.state == ExecutionState::Done {
            self.transition(ExecutionState::Idle);
        }
        self.transition(ExecutionState::Running);
        waypoint.status = WaypointStatus::InProgress;
        log::info!("Flying waypoint {}: {}", waypoint.id, waypoint.title);

        let mut state = LoopState::new();
        let mut receipt_path = None;
        let mut ignored_malformed = 0;

        if !self.project_root.is_dir() {
            let result = ExecutionResult::Failed(format!(
                "Project directory does not exist: {}",
                self.project_root.display()
            ));
            return Ok(self.finish(waypoint, state, result, None, ignored_malformed));
        }

        let checklist = Checklist::load(&self.project_root);
        let spec_hash = compute_spec_hash(&self.spec);
        let marker = waypoint.completion_marker();

        let result = loop {
            if state.iteration >= self.config.max_iterations {
                break ExecutionResult::MaxIterations;
            }
            if self.cancel.is_cancelled() {
                log::info!("Pause requested; stopping {} at iteration boundary", waypoint.id);
                self.transition(ExecutionState::PausePending);
                break ExecutionResult::Cancelled;
            }

            let iteration = state.begin_iteration();
            log::info!(
                "Waypoint {} iteration {}/{} ({})",
                waypoint.id,
                iteration,
                self.config.max_iterations,
                state.next_reason_code
            );
            self.emit(
                &waypoint.id,
                &state,
                ExecutionStep::Executing,
                format!("Iteration {} of {}", iteration, self.config.max_iterations),
            );

            let mut prompt = if iteration == 1 {
                build_execution_prompt(waypoint, &self.spec, &self.project_root, &checklist)
            } else {
                let verified = state.verified_criteria();
                build_iteration_kickoff_prompt(&KickoffInput {
                    waypoint,
                    reason_code: state.next_reason_code,
                    reason_detail: &state.next_reason_detail,
                    verified_criteria: &verified,
                    current_spec_hash: Some(&spec_hash),
                })
            };

            let policy = DirectoryPolicy::scan(&self.project_root);
            let memory_context =
                load_waypoint_memory_context(&self.project_root, waypoint, DEFAULT_MEMORY_CONTEXT_CHARS);
            let envelope = apply_context_envelope(
                &waypoint.id,
                FlyRole::Builder,
                self.config.prompt_context_chars,
                self.config.tool_output_chars,
                Some(&policy.format_for_prompt()),
                Some(&memory_context),
            );
            if envelope.overflowed {
                self.emit(
                    &waypoint.id,
                    &state,
                    ExecutionStep::Warning,
                    format!(
                        "Context envelope overflowed: used {} of {} chars",
                        envelope.used_chars(),
                        envelope.prompt_budget_chars
                    ),
                );
            }
            if let Some(memory) = envelope.text_of(WAYPOINT_MEMORY_SLICE) {
                prompt.push_str("\n\n## Prior Waypoint Memory\n");
                prompt.push_str(memory);
            }
            let system_prompt = build_system_prompt(&self.project_root, envelope.text_of(DIRECTORY_POLICY_SLICE));
            self.log_artifact(ProtocolArtifact::Envelope(envelope));

            let request = AgentRequest::new(prompt, self.project_root.clone())
                .with_system_prompt(system_prompt)
                .with_allowed_tools(self.config.allowed_tools.clone())
                .resume(state.resume_session_id.clone());

            let (tx, mut rx) = mpsc::channel(AGENT_EVENT_BUFFER);
            let current: &Waypoint = waypoint;
            let turn = self.agent.turn(request, tx);
            let drain = async {
                while let Some(event) = rx.recv().await {
                    self.handle_agent_event(current, &mut state, &policy, event);
                }
            };
            let (turn_result, ()) = tokio::join!(turn, drain);

            match turn_result {
                Ok(summary) => {
                    state.usage.add(&summary);
                    if summary.session_id.is_some() {
                        state.resume_session_id = summary.session_id.clone();
                    }
                    if state.current.output.is_empty() && !summary.full_text.is_empty() {
                        state.push_text(&summary.full_text);
                    }
                }
                Err(e) => {
                    log::error!("Agent turn failed for {}: {}", waypoint.id, e);
                    let classification = classify_execution_error(&e, &state.full_output);
                    self.emit(&waypoint.id, &state, ExecutionStep::Error, classification.error_summary.clone());
                    let mut intervention = self
                        .intervention(classification.intervention_type, waypoint, &state, classification.error_summary)
                        .with_reset_at(classification.reset_at)
                        .with_context("error", e.to_string());
                    if let Some(reset_text) = classification.reset_text {
                        intervention = intervention.with_context("reset_text", reset_text);
                    }
                    break ExecutionResult::InterventionNeeded(intervention);
                }
            }

            let parsed = parse_output(&state.full_output);
            ignored_malformed = parsed.ignored_malformed();
            if ignored_malformed > 0 {
                log::debug!("Ignored {} malformed protocol tags for {}", ignored_malformed, waypoint.id);
            }

            for report in parsed.stage_reports.items {
                if !state.record_stage(report.fingerprint()) {
                    continue;
                }
                let summary = format!("{}: {}", report.stage.as_str(), report.output);
                self.log_artifact(ProtocolArtifact::stage(&waypoint.id, report));
                self.emit(&waypoint.id, &state, ExecutionStep::Stage, summary);
            }
            for verification in parsed.criteria.items {
                state.capture_criterion(verification);
            }
            for validation in parse_validations(&state.current.output).items {
                state.record_validation_command(&validation.command);
                if validation.exit_code != 0 {
                    self.emit(
                        &waypoint.id,
                        &state,
                        ExecutionStep::ValidationFailed,
                        format!("{} exited with {}", validation.command, validation.exit_code),
                    );
                }
            }

            let clarification = handle_clarification_requests(&mut state, &waypoint.id, self.artifact_log.as_ref());
            for request in &clarification.requests {
                self.emit(
                    &waypoint.id,
                    &state,
                    ExecutionStep::ClarificationPending,
                    request.blocking_question.clone(),
                );
            }
            for response in &clarification.responses {
                self.emit(
                    &waypoint.id,
                    &state,
                    ExecutionStep::ProtocolArtifact,
                    format!("Clarification answered: {}", response.chosen_option),
                );
            }
            if clarification.exhausted {
                let intervention = self.intervention(InterventionType::UserRequested, waypoint, &state, EXHAUSTED_DETAIL);
                break ExecutionResult::InterventionNeeded(intervention);
            }

            let unresolved = state.unresolved_criteria(waypoint.acceptance_criteria.len());
            if state.current.output.contains(&marker) && unresolved.is_empty() && !state.clarification.unresolved {
                log::info!("Waypoint {} reported complete at iteration {}", waypoint.id, iteration);
                state.completion = Some(CompletionRecord {
                    iteration,
                    output: state.current.output.clone(),
                    criteria: state.verified_criteria(),
                });
                self.emit(&waypoint.id, &state, ExecutionStep::Finalizing, "Writing receipt");
                if self.config.write_receipt {
                    receipt_path = self.write_receipt(waypoint, &state);
                }
                self.emit(&waypoint.id, &state, ExecutionStep::Complete, format!("{} complete", waypoint.id));
                break ExecutionResult::Success;
            }

            if needs_user_intervention(&state.current.output) {
                let reason = extract_intervention_reason(&state.current.output);
                log::warn!("Agent asked for human help on {}: {}", waypoint.id, reason);
                let intervention = self.intervention(InterventionType::UserRequested, waypoint, &state, reason);
                break ExecutionResult::InterventionNeeded(intervention);
            }

            let verified = state.verified_criteria();
            let observation = IterationObservation {
                waypoint_id: &waypoint.id,
                iteration_output: &state.current.output,
                completion_marker: &marker,
                stage_reports_logged: state.current.stage_reports_logged,
                scope_drift_detected: state.current.scope_drift_detected,
            };
            let decision = build_escalation_decision(
                &observation,
                state.protocol_derailment_streak,
                &waypoint.acceptance_criteria,
                &verified,
                self.config.max_protocol_derailments,
            );
            state.protocol_derailment_streak = decision.protocol_derailment_streak;
            state.record_derailments(&decision.protocol_issues);
            if !decision.protocol_issues.is_empty() {
                self.emit(&waypoint.id, &state, ExecutionStep::Warning, decision.next_reason_detail.clone());
            }

            if decision.should_escalate {
                let summary = decision
                    .escalation_summary
                    .unwrap_or_else(|| decision.next_reason_detail.clone());
                let intervention = self
                    .intervention(InterventionType::ExecutionError, waypoint, &state, summary)
                    .with_context("protocol_issues", decision.protocol_issues.clone());
                break ExecutionResult::InterventionNeeded(intervention);
            }

            // A fresh clarification answer is the better reason for the next pass
            if clarification.responses.is_empty() {
                state.set_next_reason(decision.next_reason_code, decision.next_reason_detail);
            }
        };

        Ok(self.finish(waypoint, state, result, receipt_path, ignored_malformed))
    }

    fn handle_agent_event(&self, waypoint: &Waypoint, state: &mut LoopState, policy: &DirectoryPolicy, event: AgentEvent) {
        match event {
            AgentEvent::Text { text } => {
                state.push_text(&text);
                self.emit(&waypoint.id, state, ExecutionStep::Streaming, text);
            }
            AgentEvent::ToolUse {
                tool_name,
                tool_input,
                tool_output,
            } => {
                let operation = extract_file_operation(&tool_name, &tool_input);
                if let Some(op) = &operation {
                    let violations = scope_violations(&self.project_root, policy, std::slice::from_ref(op));
                    if !violations.is_empty() {
                        state.current.scope_drift_detected = true;
                        log::warn!("Scope drift on {}: {} {}", waypoint.id, tool_name, violations.join(", "));
                        self.emit(
                            &waypoint.id,
                            state,
                            ExecutionStep::Warning,
                            format!("Blocked path access: {}", violations.join(", ")),
                        );
                    }
                    state.current.file_operations.push(op.clone());
                }
                let file_operations = operation.into_iter().collect();
                self.emit_with_files(&waypoint.id, state, ExecutionStep::ToolUse, tool_name.clone(), file_operations);

                if tool_name == "Bash"
                    && let Some(command) = tool_input.get("command").and_then(|c| c.as_str())
                    && let Some(raw) = tool_output.as_deref()
                    && let Some(category) = detect_validation_category(command)
                {
                    let (stdout, stderr, exit_code) = parse_tool_output(raw);
                    log::debug!("Validation evidence for {}: {} -> {}", waypoint.id, command, exit_code);
                    let evidence = CapturedEvidence {
                        command: command.to_string(),
                        exit_code,
                        stdout,
                        stderr,
                        captured_at: Utc::now(),
                    };
                    state
                        .tool_validation_evidence
                        .insert(normalize_command(command), evidence.clone());
                    state.tool_validation_categories.insert(category, evidence);
                }

                state.current.last_tool_output =
                    clip_tool_output_for_context(tool_output.as_deref(), self.config.tool_output_chars);
                state.current.last_tool_name = Some(tool_name);
                state.current.last_tool_input = tool_input;
            }
            AgentEvent::Complete(_) => {}
        }
    }

    /// Receipt from code-captured evidence; `None` when nothing was captured
    fn write_receipt(&self, waypoint: &Waypoint, state: &LoopState) -> Option<PathBuf> {
        let mut builder = ReceiptBuilder::new(
            &waypoint.id,
            &waypoint.title,
            &waypoint.objective,
            waypoint.acceptance_criteria.clone(),
        );
        for (category, evidence) in &state.tool_validation_categories {
            builder.capture(*category, evidence.clone());
        }
        for verification in state.captured_criteria.values() {
            builder.capture_criterion(verification.clone());
        }
        if !builder.has_evidence() {
            log::info!("No validation evidence captured for {}; receipt not written", waypoint.id);
            return None;
        }

        let path = FsReceiptStore::receipt_path(&self.project_root, &waypoint.id, Utc::now());
        match builder.build().save(&path) {
            Ok(()) => Some(path),
            Err(e) => {
                log::error!("Failed to write receipt for {}: {}", waypoint.id, e);
                None
            }
        }
    }

    fn finish(
        &mut self,
        waypoint: &mut Waypoint,
        state: LoopState,
        result: ExecutionResult,
        receipt_path: Option<PathBuf>,
        ignored_malformed: usize,
    ) -> ExecutionReport {
        let error_summary = match &result {
            ExecutionResult::Failed(reason) => Some(reason.clone()),
            ExecutionResult::InterventionNeeded(intervention) => Some(intervention.error_summary.clone()),
            ExecutionResult::MaxIterations => Some(format!("Reached max iterations ({})", self.config.max_iterations)),
            ExecutionResult::Success | ExecutionResult::Cancelled => None,
        };

        match &result {
            ExecutionResult::Success => self.transition(ExecutionState::Done),
            ExecutionResult::Cancelled => {
                waypoint.status = WaypointStatus::Pending;
                self.transition(ExecutionState::Paused);
            }
            ExecutionResult::InterventionNeeded(_) => {
                waypoint.status = WaypointStatus::Failed;
                self.transition(ExecutionState::Intervention);
            }
            ExecutionResult::Failed(_) | ExecutionResult::MaxIterations => {
                waypoint.status = WaypointStatus::Failed;
                self.transition(ExecutionState::Done);
            }
        }

        match &error_summary {
            Some(summary) => log::warn!("Waypoint {} ended {}: {}", waypoint.id, result.label(), summary),
            None => log::info!("Waypoint {} ended {}", waypoint.id, result.label()),
        }

        if self.config.persist_memory && self.project_root.is_dir() {
            persist_waypoint_memory(
                &self.project_root,
                waypoint,
                &state,
                result.label(),
                self.config.max_iterations,
                error_summary,
            );
        }

        ExecutionReport {
            iterations: state.iteration,
            usage: state.usage,
            result,
            receipt_path,
            ignored_malformed,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ScriptedAgent, ScriptedError, ScriptedTurn};
    use crate::domain::{PauseFlag, progress_channel};
    use serde_json::json;
    use tempfile::TempDir;

    const STAGE: &str = r#"<execution-stage>{"stage": "code", "success": true, "output": "wrote it"}</execution-stage>"#;

    fn waypoint() -> Waypoint {
        Waypoint::new("WP-1", "Add greeting", "Print hello").criterion("greeting printed")
    }

    fn verified(index: usize) -> String {
        format!(
            "<acceptance-criterion><index>{}</index><status>verified</status><text>c</text><evidence>ok</evidence></acceptance-criterion>",
            index
        )
    }

    fn executor(dir: &TempDir, turns: Vec<ScriptedTurn>) -> WaypointExecutor<ScriptedAgent> {
        WaypointExecutor::new(Arc::new(ScriptedAgent::new(turns)), dir.path(), "# Spec\nSay hello.\n")
    }

    #[tokio::test]
    async fn test_success_on_first_iteration() {
        let dir = TempDir::new().unwrap();
        let text = format!("{}\n{}\n<waypoint-complete>WP-1</waypoint-complete>", STAGE, verified(0));
        let turn = ScriptedTurn::text(text)
            .with_tool("Bash", json!({"command": "cargo test"}), Some("ok\nExit code: 0"))
            .with_session("sess-1")
            .with_cost(0.1);
        let mut exec = executor(&dir, vec![turn]);
        let mut wp = waypoint();

        let report = exec.execute(&mut wp).await.unwrap();
        assert_eq!(report.result, ExecutionResult::Success);
        assert_eq!(report.iterations, 1);
        assert_eq!(wp.status, WaypointStatus::InProgress);
        assert_eq!(exec.state(), ExecutionState::Done);
        assert!(report.receipt_path.as_ref().is_some_and(|p| p.exists()));
        assert_eq!(report.state.resume_session_id.as_deref(), Some("sess-1"));
        assert!((report.usage.cost_usd - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_receipt_without_evidence() {
        let dir = TempDir::new().unwrap();
        let text = format!("{}\n{}\n<waypoint-complete>WP-1</waypoint-complete>", STAGE, verified(0));
        let mut exec = executor(&dir, vec![ScriptedTurn::text(text)]);
        let mut wp = waypoint();
        let report = exec.execute(&mut wp).await.unwrap();
        assert!(report.result.is_success());
        assert!(report.receipt_path.is_none());
    }

    #[tokio::test]
    async fn test_marker_without_criteria_keeps_going() {
        let dir = TempDir::new().unwrap();
        let turns = vec![
            ScriptedTurn::text(format!("{}\n<waypoint-complete>WP-1</waypoint-complete>", STAGE)),
            ScriptedTurn::text(format!(
                "{}\n{}\n<waypoint-complete>WP-1</waypoint-complete>",
                STAGE.replace("wrote it", "fixed it"),
                verified(0)
            )),
        ];
        let agent = Arc::new(ScriptedAgent::new(turns));
        let mut exec = WaypointExecutor::new(agent.clone(), dir.path(), "spec");
        let mut wp = waypoint();
        let report = exec.execute(&mut wp).await.unwrap();
        assert_eq!(report.result, ExecutionResult::Success);
        assert_eq!(report.iterations, 2);

        let requests = agent.requests();
        assert!(requests[1].prompt.starts_with("Iteration kickoff\nReason: incomplete_criteria"));
    }

    #[tokio::test]
    async fn test_provider_error_needs_intervention() {
        let dir = TempDir::new().unwrap();
        let turns = vec![ScriptedTurn::failing(ScriptedError::RateLimited)];
        let mut exec = executor(&dir, turns);
        let mut wp = waypoint();
        let report = exec.execute(&mut wp).await.unwrap();
        match report.result {
            ExecutionResult::InterventionNeeded(intervention) => {
                assert_eq!(intervention.intervention_type, InterventionType::RateLimited);
                assert_eq!(intervention.iteration, 1);
            }
            other => panic!("expected intervention, got {:?}", other),
        }
        assert_eq!(wp.status, WaypointStatus::Failed);
        assert_eq!(exec.state(), ExecutionState::Intervention);
    }

    #[tokio::test]
    async fn test_cancel_before_first_iteration() {
        let dir = TempDir::new().unwrap();
        let flag = PauseFlag::new();
        flag.request();
        let mut exec = executor(&dir, vec![]).with_cancel_signal(Arc::new(flag));
        let mut wp = waypoint();
        let report = exec.execute(&mut wp).await.unwrap();
        assert_eq!(report.result, ExecutionResult::Cancelled);
        assert_eq!(report.iterations, 0);
        assert_eq!(wp.status, WaypointStatus::Pending);
        assert_eq!(exec.state(), ExecutionState::Paused);
    }

    #[tokio::test]
    async fn test_missing_project_fails() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let mut exec = WaypointExecutor::new(Arc::new(ScriptedAgent::new(vec![])), &missing, "spec");
        let mut wp = waypoint();
        let report = exec.execute(&mut wp).await.unwrap();
        assert!(matches!(report.result, ExecutionResult::Failed(ref r) if r.contains("does not exist")));
        assert_eq!(wp.status, WaypointStatus::Failed);
    }

    #[tokio::test]
    async fn test_progress_events_streamed() {
        let dir = TempDir::new().unwrap();
        let (tx, mut rx) = progress_channel();
        let text = format!("{}\n{}\n<waypoint-complete>WP-1</waypoint-complete>", STAGE, verified(0));
        let mut exec = executor(&dir, vec![ScriptedTurn::text(text)]).with_progress(tx);
        let mut wp = waypoint();
        exec.execute(&mut wp).await.unwrap();
        drop(exec);

        let mut steps = Vec::new();
        while let Some(event) = rx.recv().await {
            steps.push(event.step);
        }
        assert_eq!(steps.first(), Some(&ExecutionStep::Executing));
        assert!(steps.contains(&ExecutionStep::Streaming));
        assert!(steps.contains(&ExecutionStep::Stage));
        assert_eq!(steps.last(), Some(&ExecutionStep::Complete));
    }

    #[tokio::test]
    async fn test_memory_persisted() {
        let dir = TempDir::new().unwrap();
        let text = format!("{}\n{}\n<waypoint-complete>WP-1</waypoint-complete>", STAGE, verified(0));
        let mut exec = executor(&dir, vec![ScriptedTurn::text(text)]);
        let mut wp = waypoint();
        exec.execute(&mut wp).await.unwrap();
        let record = crate::fly::memory::load_waypoint_memory(dir.path(), "WP-1").unwrap();
        assert_eq!(record.result, "success");
        assert_eq!(record.verified_criteria, vec![0]);
    }
}
