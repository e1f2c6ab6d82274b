//! Subprocess execution under a timeout domain.
//!
//! Each attempt runs `sh -c <command>` with piped output. A warning event fires
//! at the domain's warning threshold; at the deadline the process (or its whole
//! process group) gets SIGTERM, then SIGKILL after the grace period. Timeouts
//! retry with backoff when the domain allows it and are reported in the
//! result, never as an `Err`.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::timeout_history::{TimeoutHistory, build_command_key};
use super::timeout_policy::{TimeoutContext, TimeoutDomain, TimeoutPolicyRegistry};
use crate::error::{FlyError, Result};

/// Exit code reported when the final attempt timed out
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep draining pipes after the process exits
const PIPE_DRAIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandEventType {
    Warning,
    Retry,
    Terminate,
    Kill,
}

/// Notification streamed to an observer while a command runs
#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    pub event_type: CommandEventType,
    pub domain: TimeoutDomain,
    pub command: String,
    pub attempt: u32,
    pub timeout_seconds: f64,
    pub detail: String,
}

/// Observer callback for command events
pub type EventSink = dyn Fn(&CommandEvent) + Send + Sync;

/// Outcome of one attempt
#[derive(Debug, Clone, Serialize)]
pub struct CommandAttemptResult {
    pub attempt: u32,
    pub timeout_seconds: f64,
    pub duration_seconds: f64,
    pub timed_out: bool,
    pub warning_emitted: bool,
    /// `None` when the process died from a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub signal_sequence: Vec<String>,
}

/// Every attempt of one command run
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    pub domain: TimeoutDomain,
    pub command: String,
    pub attempts: Vec<CommandAttemptResult>,
    pub total_duration_seconds: f64,
}

impl CommandResult {
    pub fn final_attempt(&self) -> Option<&CommandAttemptResult> {
        self.attempts.last()
    }

    pub fn timed_out(&self) -> bool {
        self.final_attempt().map(|a| a.timed_out).unwrap_or(false)
    }

    /// True if any attempt hit its deadline, including retried ones
    pub fn any_timed_out(&self) -> bool {
        self.attempts.iter().any(|a| a.timed_out)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.final_attempt().and_then(|a| a.exit_code)
    }

    pub fn stdout(&self) -> &str {
        self.final_attempt().map(|a| a.stdout.as_str()).unwrap_or("")
    }

    pub fn stderr(&self) -> &str {
        self.final_attempt().map(|a| a.stderr.as_str()).unwrap_or("")
    }

    /// 124 on timeout, otherwise the process exit code, otherwise 1
    pub fn effective_exit_code(&self) -> i32 {
        if self.timed_out() {
            return TIMEOUT_EXIT_CODE;
        }
        self.exit_code().unwrap_or(1)
    }

    pub fn success(&self) -> bool {
        self.effective_exit_code() == 0
    }

    pub fn signal_sequence(&self) -> Vec<String> {
        self.attempts.iter().flat_map(|a| a.signal_sequence.iter().cloned()).collect()
    }
}

/// A command to run
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub domain: TimeoutDomain,
    pub cwd: Option<PathBuf>,
    pub requested_timeout_seconds: Option<f64>,
    pub category: Option<String>,
    pub env: Vec<(String, String)>,
    /// Overrides the derived history key
    pub command_key: Option<String>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, domain: TimeoutDomain) -> Self {
        Self {
            command: command.into(),
            domain,
            cwd: None,
            requested_timeout_seconds: None,
            category: None,
            env: Vec::new(),
            command_key: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout_seconds(mut self, seconds: f64) -> Self {
        self.requested_timeout_seconds = Some(seconds);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Command execution interface
#[async_trait]
pub trait CommandExecution: Send + Sync {
    async fn run(&self, request: CommandRequest, on_event: Option<&EventSink>) -> Result<CommandResult>;
}

/// Runs commands under the registry's policies and feeds the shared history
#[derive(Debug, Clone)]
pub struct CommandRunner {
    registry: Arc<TimeoutPolicyRegistry>,
    history: Arc<TimeoutHistory>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Arc::new(TimeoutPolicyRegistry::new()), Arc::new(TimeoutHistory::new()))
    }
}

impl CommandRunner {
    pub fn new(registry: Arc<TimeoutPolicyRegistry>, history: Arc<TimeoutHistory>) -> Self {
        Self { registry, history }
    }

    pub fn history(&self) -> &Arc<TimeoutHistory> {
        &self.history
    }

    pub fn registry(&self) -> &Arc<TimeoutPolicyRegistry> {
        &self.registry
    }

    async fn run_attempts(&self, request: CommandRequest, on_event: Option<&EventSink>) -> Result<CommandResult> {
        let domain = request.domain;
        let policy = self.registry.policy_for(domain);
        let context = TimeoutContext {
            command: request.command.clone(),
            category: request.category.clone(),
            requested_timeout_seconds: request.requested_timeout_seconds,
        };
        let key = request.command_key.clone().unwrap_or_else(|| {
            build_command_key(
                domain,
                &request.command,
                request.category.as_deref(),
                request.cwd.as_deref(),
            )
        });

        let started = Instant::now();
        let mut attempts = Vec::new();

        for attempt in 1..=policy.backoff.max_attempts.max(1) {
            let hint = self.history.recommended_timeout_seconds(
                &key,
                policy.default_timeout_seconds,
                policy.backoff.max_timeout_seconds,
            );
            let timeout_seconds = self.registry.timeout_for_attempt(domain, &context, attempt, Some(hint));
            let warning_after = self.registry.warning_after_seconds(domain, timeout_seconds);

            log::debug!(
                "Running [{}] attempt {} with timeout {:.2}s: {}",
                domain,
                attempt,
                timeout_seconds,
                request.command
            );

            let result = run_once(
                &request,
                attempt,
                timeout_seconds,
                warning_after,
                policy.use_process_group,
                policy.signal.terminate_grace_seconds,
                on_event,
            )
            .await?;

            self.history.record(&key, result.duration_seconds, result.timed_out);
            let timed_out = result.timed_out;
            attempts.push(result);

            if timed_out && self.registry.should_retry_timeout(domain, attempt) {
                tracing::warn!(
                    domain = %domain,
                    attempt,
                    timeout_secs = timeout_seconds,
                    command = %request.command,
                    "Command timed out, retrying with backoff"
                );
                emit(
                    on_event,
                    CommandEvent {
                        event_type: CommandEventType::Retry,
                        domain,
                        command: request.command.clone(),
                        attempt,
                        timeout_seconds,
                        detail: "Retrying after timeout with backoff".to_string(),
                    },
                );
                continue;
            }

            if timed_out {
                tracing::warn!(
                    domain = %domain,
                    attempt,
                    timeout_secs = timeout_seconds,
                    command = %request.command,
                    "Command timed out"
                );
            }
            break;
        }

        Ok(CommandResult {
            domain,
            command: request.command,
            attempts,
            total_duration_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[async_trait]
impl CommandExecution for CommandRunner {
    async fn run(&self, request: CommandRequest, on_event: Option<&EventSink>) -> Result<CommandResult> {
        self.run_attempts(request, on_event).await
    }
}

fn emit(on_event: Option<&EventSink>, event: CommandEvent) {
    if let Some(sink) = on_event {
        sink(&event);
    }
}

type SharedBuf = Arc<Mutex<Vec<u8>>>;

/// Copy a pipe into a shared buffer so partial output survives an abort
fn spawn_reader<R>(pipe: Option<R>) -> (SharedBuf, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf: SharedBuf = Arc::new(Mutex::new(Vec::new()));
    let Some(mut pipe) = pipe else {
        return (buf, None);
    };
    let sink = Arc::clone(&buf);
    let handle = tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut out) = sink.lock() {
                        out.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    });
    (buf, Some(handle))
}

async fn drain(handle: Option<JoinHandle<()>>, buf: &SharedBuf) -> String {
    if let Some(mut handle) = handle
        && tokio::time::timeout(PIPE_DRAIN, &mut handle).await.is_err()
    {
        handle.abort();
    }
    let bytes = buf.lock().map(|b| b.clone()).unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn run_once(
    request: &CommandRequest,
    attempt: u32,
    timeout_seconds: f64,
    warning_after: Option<f64>,
    use_process_group: bool,
    grace_seconds: f64,
    on_event: Option<&EventSink>,
) -> Result<CommandAttemptResult> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&request.command);
    if let Some(cwd) = &request.cwd {
        cmd.current_dir(cwd);
    }
    let env: HashMap<&str, &str> = request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    cmd.envs(env);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    if use_process_group {
        cmd.process_group(0);
    }

    let started = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| FlyError::Command(format!("Failed to spawn '{}': {}", request.command, e)))?;

    let (stdout_buf, stdout_task) = spawn_reader(child.stdout.take());
    let (stderr_buf, stderr_task) = spawn_reader(child.stderr.take());

    let deadline = started + Duration::from_secs_f64(timeout_seconds.max(0.0));
    let mut warning_emitted = false;
    let mut status: Option<ExitStatus> = None;

    if let Some(warn_after) = warning_after {
        let warn_at = started + Duration::from_secs_f64(warn_after);
        match tokio::time::timeout_at(warn_at.into(), child.wait()).await {
            Ok(waited) => status = Some(waited?),
            Err(_) => {
                warning_emitted = true;
                log::warn!(
                    "Command approaching timeout ({:.2}s of {:.2}s): {}",
                    warn_after,
                    timeout_seconds,
                    request.command
                );
                emit(
                    on_event,
                    CommandEvent {
                        event_type: CommandEventType::Warning,
                        domain: request.domain,
                        command: request.command.clone(),
                        attempt,
                        timeout_seconds,
                        detail: "Timeout threshold approaching".to_string(),
                    },
                );
            }
        }
    }

    if status.is_none()
        && let Ok(waited) = tokio::time::timeout_at(deadline.into(), child.wait()).await
    {
        status = Some(waited?);
    }

    let timed_out = status.is_none();
    let mut signal_sequence = Vec::new();
    if timed_out {
        status = terminate(
            &mut child,
            request,
            attempt,
            timeout_seconds,
            use_process_group,
            grace_seconds,
            &mut signal_sequence,
            on_event,
        )
        .await?;
    }

    let stdout = drain(stdout_task, &stdout_buf).await;
    let stderr = drain(stderr_task, &stderr_buf).await;

    Ok(CommandAttemptResult {
        attempt,
        timeout_seconds,
        duration_seconds: started.elapsed().as_secs_f64(),
        timed_out,
        warning_emitted,
        exit_code: status.and_then(|s| s.code()),
        stdout,
        stderr,
        signal_sequence,
    })
}

#[derive(Clone, Copy)]
enum StopSignal {
    Term,
    Kill,
}

impl StopSignal {
    fn label(&self) -> &'static str {
        match self {
            StopSignal::Term => "SIGTERM",
            StopSignal::Kill => "SIGKILL",
        }
    }
}

/// Deliver a stop signal; returns false if the process was already gone
fn send_signal(child: &mut Child, sig: StopSignal, use_process_group: bool) -> bool {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            return false;
        };
        let pid = Pid::from_raw(pid as i32);
        let signal = match sig {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        let sent = if use_process_group {
            signal::killpg(pid, signal)
        } else {
            signal::kill(pid, signal)
        };
        sent.is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = (sig, use_process_group);
        child.start_kill().is_ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn terminate(
    child: &mut Child,
    request: &CommandRequest,
    attempt: u32,
    timeout_seconds: f64,
    use_process_group: bool,
    grace_seconds: f64,
    signal_sequence: &mut Vec<String>,
    on_event: Option<&EventSink>,
) -> Result<Option<ExitStatus>> {
    let event = |event_type: CommandEventType, detail: &str| CommandEvent {
        event_type,
        domain: request.domain,
        command: request.command.clone(),
        attempt,
        timeout_seconds,
        detail: detail.to_string(),
    };

    if send_signal(child, StopSignal::Term, use_process_group) {
        signal_sequence.push(StopSignal::Term.label().to_string());
        emit(on_event, event(CommandEventType::Terminate, "Sent SIGTERM after timeout"));
    }

    let grace = Duration::from_secs_f64(grace_seconds.max(0.0));
    if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
        return Ok(Some(waited?));
    }

    if send_signal(child, StopSignal::Kill, use_process_group) {
        signal_sequence.push(StopSignal::Kill.label().to_string());
        emit(
            on_event,
            event(CommandEventType::Kill, "Sent SIGKILL after terminate grace period"),
        );
    } else {
        let _ = child.start_kill();
    }

    Ok(Some(child.wait().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::timeout_policy::TimeoutPolicy;

    fn fast_registry(domain: TimeoutDomain, attempts: u32, retry: bool) -> TimeoutPolicyRegistry {
        let mut policy = TimeoutPolicy::default_for(domain);
        policy.default_timeout_seconds = 0.05;
        policy.min_timeout_seconds = 0.01;
        policy.retry_on_timeout = retry;
        policy.backoff.max_attempts = attempts;
        policy.backoff.multiplier = 2.0;
        policy.backoff.max_timeout_seconds = 5.0;
        policy.signal.terminate_grace_seconds = 0.2;
        let mut registry = TimeoutPolicyRegistry::new();
        registry.set_policy(policy);
        registry
    }

    fn attempt(timed_out: bool, exit_code: Option<i32>) -> CommandAttemptResult {
        CommandAttemptResult {
            attempt: 1,
            timeout_seconds: 1.0,
            duration_seconds: 0.1,
            timed_out,
            warning_emitted: false,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            signal_sequence: vec![],
        }
    }

    #[test]
    fn test_effective_exit_code() {
        let mut result = CommandResult {
            domain: TimeoutDomain::LlmToolBash,
            command: "x".into(),
            attempts: vec![attempt(false, Some(3))],
            total_duration_seconds: 0.1,
        };
        assert_eq!(result.effective_exit_code(), 3);

        result.attempts = vec![attempt(true, Some(0))];
        assert_eq!(result.effective_exit_code(), TIMEOUT_EXIT_CODE);

        result.attempts = vec![attempt(false, None)];
        assert_eq!(result.effective_exit_code(), 1);
    }

    #[test]
    fn test_request_builder() {
        let req = CommandRequest::new("cargo test", TimeoutDomain::HostValidation)
            .cwd("/tmp")
            .timeout_seconds(10.0)
            .category("test")
            .env("RUST_LOG", "debug");
        assert_eq!(req.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(req.requested_timeout_seconds, Some(10.0));
        assert_eq!(req.env.len(), 1);
    }

    #[tokio::test]
    async fn test_run_captures_output_and_exit_code() {
        let runner = CommandRunner::default();
        let result = runner
            .run(
                CommandRequest::new("echo hello; echo oops >&2; exit 3", TimeoutDomain::LlmToolBash),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 1);
        assert!(!result.timed_out());
        assert_eq!(result.exit_code(), Some(3));
        assert_eq!(result.stdout().trim(), "hello");
        assert_eq!(result.stderr().trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_respects_cwd_and_env() {
        let dir = tempfile::TempDir::new().unwrap();
        let runner = CommandRunner::default();
        let result = runner
            .run(
                CommandRequest::new("pwd; echo $FLY_TEST_VAR", TimeoutDomain::LlmToolBash)
                    .cwd(dir.path())
                    .env("FLY_TEST_VAR", "present"),
                None,
            )
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.stdout().contains("present"));
    }

    #[tokio::test]
    async fn test_non_retrying_domain_fails_on_first_timeout() {
        let registry = fast_registry(TimeoutDomain::FlightTest, 3, false);
        let runner = CommandRunner::new(Arc::new(registry), Arc::new(TimeoutHistory::new()));
        let result = runner
            .run(CommandRequest::new("sleep 2", TimeoutDomain::FlightTest), None)
            .await
            .unwrap();
        assert!(result.timed_out());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.effective_exit_code(), TIMEOUT_EXIT_CODE);
        assert!(result.signal_sequence().contains(&"SIGTERM".to_string()));
    }

    #[tokio::test]
    async fn test_events_stream_to_observer() {
        let registry = fast_registry(TimeoutDomain::HostValidation, 2, true);
        let runner = CommandRunner::new(Arc::new(registry), Arc::new(TimeoutHistory::new()));
        let seen: Arc<Mutex<Vec<CommandEventType>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |event: &CommandEvent| {
            sink_seen.lock().unwrap().push(event.event_type);
        };
        let result = runner
            .run(CommandRequest::new("sleep 2", TimeoutDomain::HostValidation), Some(&sink))
            .await
            .unwrap();
        assert_eq!(result.attempts.len(), 2);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&CommandEventType::Warning));
        assert!(seen.contains(&CommandEventType::Terminate));
        assert_eq!(seen.iter().filter(|e| **e == CommandEventType::Retry).count(), 1);
    }

    #[tokio::test]
    async fn test_history_records_every_attempt() {
        let history = Arc::new(TimeoutHistory::new());
        let runner = CommandRunner::new(Arc::new(TimeoutPolicyRegistry::new()), Arc::clone(&history));
        runner
            .run(CommandRequest::new("true", TimeoutDomain::UiGitProbe), None)
            .await
            .unwrap();
        let key = build_command_key(TimeoutDomain::UiGitProbe, "true", None, None);
        assert_eq!(history.snapshot(&key).runs, 1);
    }
}
