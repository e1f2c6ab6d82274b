//! Version-control interface and its `git` CLI implementation.
//!
//! Every git invocation runs through the command runner under the
//! `GitOperation` timeout domain, so slow repositories feed the shared
//! timeout history like any other command.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FlyError, Result};
use crate::runtime::{CommandExecution, CommandRequest, CommandResult, CommandRunner, TimeoutDomain};

/// Default `.gitignore` for projects initialized by the commit gate
pub const DEFAULT_GITIGNORE: &str = "\
# Waypoints application logs (not project artifacts)
.waypoints/debug.log
.waypoints/**/debug.log

# User settings (not project-specific)
.waypoints/settings.json

# Build artifacts
target/
build/
dist/
out/
*.egg-info/

# Dependencies
node_modules/
vendor/

# Python
__pycache__/
*.py[cod]
*$py.class
.venv/
venv/
.env
.coverage
.pytest_cache/
.ruff_cache/
.mypy_cache/

# IDE
.idea/
.vscode/
*.swp
*.swo

# OS
.DS_Store
Thumbs.db
";

const GITIGNORE_SENTINEL: &str = ".waypoints/debug.log";

/// Outcome of a git operation that does not produce a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitResult {
    pub success: bool,
    pub message: String,
    pub output: String,
}

impl GitResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            output: String::new(),
        }
    }

    fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Turn a failed result into `FlyError::Git`
    pub fn into_result(self) -> Result<GitResult> {
        if self.success {
            Ok(self)
        } else {
            Err(FlyError::Git(self.message))
        }
    }
}

/// Outcome of `Vcs::commit`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { hash: Option<String> },
    NothingToCommit,
    Failed(String),
}

/// Version-control operations the commit gate needs
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn is_repo(&self) -> bool;

    /// Initialize a repository and write the default `.gitignore`
    async fn init(&self) -> GitResult;

    async fn stage_all(&self) -> GitResult;

    async fn commit(&self, message: &str) -> CommitOutcome;

    /// Short hash of HEAD, if any commit exists
    async fn head_commit(&self) -> Option<String>;

    /// Create an annotated tag; an existing tag is left alone
    async fn tag(&self, name: &str, message: &str) -> GitResult;

    async fn reset_hard(&self, target: &str) -> GitResult;
}

/// `git` CLI in one working directory
#[derive(Debug, Clone)]
pub struct GitService {
    working_dir: PathBuf,
    runner: CommandRunner,
}

impl GitService {
    pub fn new(working_dir: impl Into<PathBuf>, runner: CommandRunner) -> Self {
        Self {
            working_dir: working_dir.into(),
            runner,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn run_git(&self, args: &[&str]) -> Result<CommandResult> {
        let command = std::iter::once("git".to_string())
            .chain(args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ");
        log::debug!("Running: {}", command);
        let request = CommandRequest::new(command, TimeoutDomain::GitOperation).cwd(&self.working_dir);
        self.runner.run(request, None).await
    }

    async fn git_succeeds(&self, args: &[&str]) -> bool {
        matches!(self.run_git(args).await, Ok(result) if result.success())
    }

    async fn has_staged_changes(&self) -> bool {
        // `diff --quiet` exits 1 when there are differences
        match self.run_git(&["diff", "--cached", "--quiet"]).await {
            Ok(result) => !result.timed_out() && result.exit_code() != Some(0),
            Err(_) => false,
        }
    }

    fn write_gitignore(&self) -> Result<()> {
        let path = self.working_dir.join(".gitignore");
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            if !content.contains(GITIGNORE_SENTINEL) {
                fs::write(&path, format!("{}\n{}", content, DEFAULT_GITIGNORE))?;
                log::info!("Appended waypoint entries to {}", path.display());
            }
        } else {
            fs::write(&path, DEFAULT_GITIGNORE)?;
            log::info!("Created {}", path.display());
        }
        Ok(())
    }
}

fn failure_text(result: &CommandResult) -> String {
    if result.timed_out() {
        return format!("timed out after {:.1}s", result.total_duration_seconds);
    }
    let stderr = result.stderr().trim();
    if stderr.is_empty() {
        result.stdout().trim().to_string()
    } else {
        stderr.to_string()
    }
}

#[async_trait]
impl Vcs for GitService {
    async fn is_repo(&self) -> bool {
        self.git_succeeds(&["rev-parse", "--git-dir"]).await
    }

    async fn init(&self) -> GitResult {
        if self.is_repo().await {
            return GitResult::ok("Already a git repository");
        }
        let result = match self.run_git(&["init"]).await {
            Ok(result) => result,
            Err(e) => return GitResult::failed(format!("Git error: {}", e)),
        };
        if !result.success() {
            return GitResult::failed(format!("Failed to initialize: {}", failure_text(&result)));
        }
        if let Err(e) = self.write_gitignore() {
            log::warn!("Failed to write .gitignore: {}", e);
        }
        log::info!("Initialized git repository at {}", self.working_dir.display());
        GitResult::ok("Initialized git repository").with_output(result.stdout())
    }

    async fn stage_all(&self) -> GitResult {
        match self.run_git(&["add", "."]).await {
            Ok(result) if result.success() => GitResult::ok("Staged all changes"),
            Ok(result) => GitResult::failed(format!("Staging error: {}", failure_text(&result))),
            Err(e) => GitResult::failed(format!("Staging error: {}", e)),
        }
    }

    async fn commit(&self, message: &str) -> CommitOutcome {
        if !self.has_staged_changes().await {
            return CommitOutcome::NothingToCommit;
        }
        let result = match self.run_git(&["commit", "-m", message]).await {
            Ok(result) => result,
            Err(e) => return CommitOutcome::Failed(format!("Commit error: {}", e)),
        };
        if result.success() {
            log::info!("Created commit: {}", message.chars().take(50).collect::<String>());
            return CommitOutcome::Committed {
                hash: self.head_commit().await,
            };
        }
        let combined = format!("{}{}", result.stdout(), result.stderr());
        if combined.contains("nothing to commit") {
            return CommitOutcome::NothingToCommit;
        }
        log::error!("Commit failed: {}", failure_text(&result));
        CommitOutcome::Failed(failure_text(&result))
    }

    async fn head_commit(&self) -> Option<String> {
        match self.run_git(&["rev-parse", "--short", "HEAD"]).await {
            Ok(result) if result.success() => Some(result.stdout().trim().to_string()).filter(|h| !h.is_empty()),
            _ => None,
        }
    }

    async fn tag(&self, name: &str, message: &str) -> GitResult {
        if let Ok(check) = self.run_git(&["tag", "-l", name]).await
            && check.stdout().lines().any(|line| line.trim() == name)
        {
            log::warn!("Tag already exists: {}", name);
            return GitResult::ok(format!("Tag already exists: {}", name));
        }
        match self.run_git(&["tag", "-a", name, "-m", message]).await {
            Ok(result) if result.success() => {
                log::info!("Created tag: {}", name);
                GitResult::ok(format!("Created tag: {}", name))
            }
            Ok(result) => GitResult::failed(format!("Tag failed: {}", failure_text(&result))),
            Err(e) => GitResult::failed(format!("Tag error: {}", e)),
        }
    }

    async fn reset_hard(&self, target: &str) -> GitResult {
        if !self.git_succeeds(&["rev-parse", "--verify", target]).await {
            return GitResult::failed(format!("Target not found: {}", target));
        }
        match self.run_git(&["reset", "--hard", target]).await {
            Ok(result) if result.success() => {
                log::info!("Reset to: {}", target);
                GitResult::ok(format!("Reset to {}", target)).with_output(result.stdout())
            }
            Ok(result) => GitResult::failed(format!("Reset failed: {}", failure_text(&result))),
            Err(e) => GitResult::failed(format!("Reset error: {}", e)),
        }
    }
}

/// Single-quote an argument for `sh -c`
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@'))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'\''"#))
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("rev-parse"), "rev-parse");
        assert_eq!(shell_quote("feat(x): Complete it"), "'feat(x): Complete it'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_gitignore_written_once() {
        let dir = TempDir::new().unwrap();
        let git = GitService::new(dir.path(), CommandRunner::default());
        fs::write(dir.path().join(".gitignore"), "custom/\n").unwrap();
        git.write_gitignore().unwrap();
        git.write_gitignore().unwrap();
        let content = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(content.starts_with("custom/\n"));
        assert_eq!(content.matches(GITIGNORE_SENTINEL).count(), 1);
    }

    #[test]
    fn test_git_result_into_result() {
        assert!(GitResult::ok("fine").into_result().is_ok());
        let err = GitResult::failed("nope").into_result();
        assert!(matches!(err, Err(FlyError::Git(m)) if m == "nope"));
    }

    #[tokio::test]
    async fn test_not_a_repo() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = GitService::new(dir.path(), CommandRunner::default());
        // A temp dir can sit inside a checkout; only assert when it does not
        if !git.is_repo().await {
            assert!(git.head_commit().await.is_none());
            let reset = git.reset_hard("HEAD").await;
            assert!(!reset.success);
            assert_eq!(reset.message, "Target not found: HEAD");
        }
    }

    #[tokio::test]
    async fn test_init_creates_gitignore() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let git = GitService::new(dir.path(), CommandRunner::default());
        let result = git.init().await;
        assert!(result.success, "{}", result.message);
        assert!(git.is_repo().await);
        assert!(dir.path().join(".gitignore").exists());
    }
}
