//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - exec: run a shell command under a timeout domain
//! - parse: decode protocol tags from agent output
//! - replay: fly a waypoint against a recorded transcript
//! - commit / rollback: the receipt gate and hard reset
//! - classify: provider error classification

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// waypoint-fly - supervise agent execution of planned waypoints
#[derive(Parser, Debug)]
#[command(name = "waypoint-fly")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a shell command with domain timeouts, retries and history
    Exec {
        /// Command line passed to `sh -c`
        command: String,

        /// Timeout domain (host_validation, llm_tool_bash, flight_test, ui_git_probe, git_operation)
        #[arg(short, long, default_value = "host_validation")]
        domain: String,

        /// Requested timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,

        /// Working directory
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Print protocol artifacts found in agent output as JSON
    Parse {
        /// Output file, or `-` for stdin
        file: PathBuf,
    },

    /// Fly a waypoint with a scripted agent replaying a transcript
    Replay {
        /// Waypoint JSON or YAML file
        #[arg(short, long)]
        waypoint: PathBuf,

        /// Transcript: JSON array of scripted turns
        #[arg(short, long)]
        transcript: PathBuf,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Product spec file (defaults to docs/product-spec.md in the project)
        #[arg(short, long)]
        spec: Option<PathBuf>,
    },

    /// Validate the latest receipt and commit the waypoint
    Commit {
        /// Waypoint JSON or YAML file
        #[arg(short, long)]
        waypoint: PathBuf,

        /// Project slug used in commit messages and tags
        #[arg(short, long)]
        slug: String,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: PathBuf,
    },

    /// Hard reset the project to a ref (defaults to HEAD)
    Rollback {
        /// Commit, branch or tag
        git_ref: Option<String>,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Flight plan to reload after the reset
        #[arg(long)]
        plan: Option<PathBuf>,
    },

    /// Classify provider error text
    Classify {
        /// Error message or agent output
        text: String,
    },
}
