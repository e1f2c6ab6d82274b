use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

use waypoint_fly::agent::{AgentError, ScriptedAgent};
use waypoint_fly::domain::{ExecutionResult, ExecutionStep, Waypoint, progress_channel};
use waypoint_fly::fly::{WaypointExecutor, classify_execution_error};
use waypoint_fly::git::{FsReceiptStore, GitService, commit_waypoint, rollback_to_ref};
use waypoint_fly::protocol::{JsonlArtifactLog, parse_output};
use waypoint_fly::runtime::{
    CommandEvent, CommandExecution, CommandRequest, CommandRunner, EventSink, TimeoutDomain, TimeoutHistory,
};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("waypoint-fly")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("waypoint-fly.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_runner(config: &Config) -> Result<CommandRunner> {
    let history = if config.history.persist {
        TimeoutHistory::load(&config.history.path)
            .context(format!("Failed to load timeout history from {}", config.history.path.display()))?
    } else {
        TimeoutHistory::new()
    };
    Ok(CommandRunner::new(Arc::new(config.timeout_registry()), Arc::new(history)))
}

async fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Exec {
            command,
            domain,
            timeout,
            cwd,
        } => handle_exec_command(command, domain, *timeout, cwd.as_deref(), config).await,
        Commands::Parse { file } => handle_parse_command(file).map(|_| 0),
        Commands::Replay {
            waypoint,
            transcript,
            project,
            spec,
        } => handle_replay_command(waypoint, transcript, project, spec.as_deref(), cli.is_verbose(), config).await,
        Commands::Commit { waypoint, slug, project } => handle_commit_command(waypoint, slug, project, config).await,
        Commands::Rollback { git_ref, project, plan } => {
            handle_rollback_command(git_ref.as_deref(), project, plan.as_deref(), config).await
        }
        Commands::Classify { text } => handle_classify_command(text).map(|_| 0),
    }
}

async fn handle_exec_command(
    command: &str,
    domain: &str,
    timeout: Option<f64>,
    cwd: Option<&Path>,
    config: &Config,
) -> Result<i32> {
    let Some(domain) = TimeoutDomain::parse(domain) else {
        bail!("Unknown timeout domain: {}", domain);
    };
    info!("Running command in {} domain: {}", domain, command);

    let runner = build_runner(config)?;
    let mut request = CommandRequest::new(command, domain);
    if let Some(seconds) = timeout {
        request = request.timeout_seconds(seconds);
    }
    if let Some(dir) = cwd {
        request = request.cwd(dir);
    }

    let on_event = |event: &CommandEvent| {
        eprintln!(
            "{} {:?} attempt {} ({:.2}s): {}",
            "event:".dimmed(),
            event.event_type,
            event.attempt,
            event.timeout_seconds,
            event.detail
        );
    };
    let sink: &EventSink = &on_event;
    let result = runner.run(request, Some(sink)).await.context("Command failed to start")?;

    print!("{}", result.stdout());
    eprint!("{}", result.stderr());
    for attempt in &result.attempts {
        let status = if attempt.timed_out {
            "timed out".red()
        } else {
            "finished".green()
        };
        eprintln!(
            "{} {} {} after {:.2}s (timeout {:.2}s, exit {:?})",
            "attempt".cyan(),
            attempt.attempt,
            status,
            attempt.duration_seconds,
            attempt.timeout_seconds,
            attempt.exit_code
        );
    }

    if config.history.persist {
        runner.history().save().context("Failed to save timeout history")?;
    }
    Ok(result.effective_exit_code())
}

fn handle_parse_command(file: &Path) -> Result<()> {
    let text = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
        buf
    } else {
        fs::read_to_string(file).context(format!("Failed to read {}", file.display()))?
    };

    let parsed = parse_output(&text);
    let output = serde_json::json!({
        "stage_reports": parsed.stage_reports.items,
        "criteria": parsed.criteria.items,
        "validations": parsed.validations.items,
        "clarifications": parsed.clarifications.items,
        "ignored_malformed": parsed.ignored_malformed(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn handle_replay_command(
    waypoint_path: &Path,
    transcript: &Path,
    project: &Path,
    spec_path: Option<&Path>,
    verbose: bool,
    config: &Config,
) -> Result<i32> {
    let mut waypoint = Waypoint::load(waypoint_path).context(format!("Failed to load {}", waypoint_path.display()))?;
    let agent = ScriptedAgent::from_transcript(transcript).context("Failed to load transcript")?;
    let spec_path = spec_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| project.join("docs").join("product-spec.md"));
    let spec = fs::read_to_string(&spec_path).unwrap_or_else(|e| {
        log::warn!("No product spec at {}: {}", spec_path.display(), e);
        String::new()
    });

    let artifact_log = JsonlArtifactLog::for_project(project).context("Failed to open protocol trail")?;
    let (tx, mut rx) = progress_channel();
    let mut executor = WaypointExecutor::with_config(Arc::new(agent), project, spec, config.executor_config())
        .with_artifact_log(Arc::new(artifact_log))
        .with_progress(tx);

    println!("{} {} - {}", "Flying:".green(), waypoint.id, waypoint.title);
    let report = executor.execute(&mut waypoint).await.context("Execution failed")?;
    drop(executor);

    while let Some(event) = rx.recv().await {
        let label = format!("[{}/{}] {:?}", event.iteration, event.total_iterations, event.step);
        match event.step {
            ExecutionStep::Streaming if !verbose => continue,
            ExecutionStep::Error | ExecutionStep::ValidationFailed => println!("{} {}", label.red(), event.output),
            ExecutionStep::Warning => println!("{} {}", label.yellow(), event.output),
            _ => println!("{} {}", label.cyan(), event.output),
        }
    }

    println!(
        "{} {} after {} iteration(s), cost ${:.4}",
        "Outcome:".green(),
        report.result.label(),
        report.iterations,
        report.usage.cost_usd
    );
    if let Some(path) = &report.receipt_path {
        println!("{} {}", "Receipt:".green(), path.display());
    }
    if report.ignored_malformed > 0 {
        println!("{} {} malformed protocol tag(s) ignored", "Note:".yellow(), report.ignored_malformed);
    }

    match report.result {
        ExecutionResult::Success => Ok(0),
        ExecutionResult::InterventionNeeded(intervention) => {
            println!("{}", serde_json::to_string_pretty(&intervention)?);
            Ok(2)
        }
        ExecutionResult::Failed(reason) => {
            println!("{} {}", "Failed:".red(), reason);
            Ok(1)
        }
        ExecutionResult::MaxIterations | ExecutionResult::Cancelled => Ok(1),
    }
}

async fn handle_commit_command(waypoint_path: &Path, slug: &str, project: &Path, config: &Config) -> Result<i32> {
    let mut waypoint = Waypoint::load(waypoint_path).context(format!("Failed to load {}", waypoint_path.display()))?;
    let runner = build_runner(config)?;
    let vcs = GitService::new(project, runner);

    let result = commit_waypoint(project, slug, &mut waypoint, &config.git_policy(), &vcs, &FsReceiptStore).await;
    if result.initialized_repo {
        println!("{} initialized git repository", "Note:".yellow());
    }
    if result.committed {
        println!(
            "{} {} ({})",
            "Committed:".green(),
            result.message,
            result.commit_hash.as_deref().unwrap_or("unknown")
        );
        if let Some(tag) = &result.tag_name {
            println!("{} {}", "Tagged:".green(), tag);
        }
    } else {
        println!("{} {}", "Not committed:".yellow(), result.message);
    }
    println!("Waypoint {} is {}", waypoint.id, waypoint.status);
    Ok(if result.committed { 0 } else { 1 })
}

async fn handle_rollback_command(
    git_ref: Option<&str>,
    project: &Path,
    plan: Option<&Path>,
    config: &Config,
) -> Result<i32> {
    let vcs = GitService::new(project, build_runner(config)?);
    let loader = || -> waypoint_fly::Result<()> {
        if let Some(plan) = plan {
            Waypoint::load(plan)?;
        }
        Ok(())
    };

    let result = rollback_to_ref(&vcs, git_ref, loader).await;
    if !result.success {
        println!("{} {}", "Rollback failed:".red(), result.message);
        return Ok(1);
    }
    println!("{} {}", "Rolled back:".green(), result.message);
    if result.plan_reloaded {
        println!("Flight plan reloaded");
    }
    Ok(0)
}

fn handle_classify_command(text: &str) -> Result<()> {
    let classification = classify_execution_error(&AgentError::Other(text.to_string()), "");
    println!("{}", serde_json::to_string_pretty(&classification)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    let code = run_application(&cli, &config).await.context("Application failed")?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
