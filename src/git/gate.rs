//! Receipt-gated commit and rollback.
//!
//! The agent produces a receipt, code validates it, and only then does code
//! stage, commit and tag. Nothing here trusts what the agent said it did.

use std::path::Path;

use crate::domain::Waypoint;
use crate::error::Result;
use crate::git::receipt::{ReceiptStore, ReceiptValidator};
use crate::git::service::{CommitOutcome, Vcs};

/// What the gate is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GitPolicy {
    pub auto_commit: bool,
    pub auto_init: bool,
    pub run_checklist: bool,
    pub create_waypoint_tags: bool,
}

impl Default for GitPolicy {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_init: true,
            run_checklist: true,
            create_waypoint_tags: true,
        }
    }
}

/// Result of `commit_waypoint`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitResult {
    pub committed: bool,
    pub message: String,
    pub commit_hash: Option<String>,
    pub tag_name: Option<String>,
    pub initialized_repo: bool,
}

impl CommitResult {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Validate the latest receipt and commit the waypoint's work.
///
/// Receipt validation runs before any repository operation. The waypoint is
/// tagged and marked complete only when a commit was actually created.
pub async fn commit_waypoint(
    project_root: &Path,
    project_slug: &str,
    waypoint: &mut Waypoint,
    policy: &GitPolicy,
    vcs: &dyn Vcs,
    store: &dyn ReceiptStore,
) -> CommitResult {
    if !policy.auto_commit {
        log::info!("Auto-commit disabled, skipping commit for {}", waypoint.id);
        return CommitResult::skipped("Auto-commit disabled");
    }

    // The receipt is checked before the repository is touched at all
    if policy.run_checklist {
        let Some(receipt_path) = store.find_latest_receipt(project_root, &waypoint.id) else {
            log::warn!("Skipping commit for {}: no receipt found", waypoint.id);
            return CommitResult::skipped(format!("No receipt found for {}", waypoint.id));
        };
        let validation = ReceiptValidator::new().validate(Some(&receipt_path), &waypoint.id);
        if !validation.valid {
            log::warn!("Skipping commit for {}: {}", waypoint.id, validation.message);
            return CommitResult::skipped(format!("Receipt invalid: {}", validation.message));
        }
    }

    let mut initialized_repo = false;
    if !vcs.is_repo().await {
        if !policy.auto_init {
            return CommitResult::skipped("Not a git repo and auto-init disabled");
        }
        let init = vcs.init().await;
        if !init.success {
            log::error!("Failed to init git repo: {}", init.message);
            return CommitResult::skipped(format!("Failed to init git repo: {}", init.message));
        }
        initialized_repo = true;
    }

    let staged = vcs.stage_all().await;
    if !staged.success {
        return CommitResult {
            initialized_repo,
            ..CommitResult::skipped(format!("Commit failed: {}", staged.message))
        };
    }

    let message = format!("feat({}): Complete {}", project_slug, waypoint.title);
    let (commit_hash, mut result_message) = match vcs.commit(&message).await {
        CommitOutcome::Committed { hash } => {
            let text = match &hash {
                Some(h) => format!("Committed {}", h),
                None => "Committed".to_string(),
            };
            (hash, text)
        }
        CommitOutcome::NothingToCommit => {
            log::info!("Nothing to commit for {}; no tag created", waypoint.id);
            return CommitResult {
                initialized_repo,
                ..CommitResult::skipped("Nothing to commit")
            };
        }
        CommitOutcome::Failed(e) => {
            return CommitResult {
                initialized_repo,
                ..CommitResult::skipped(format!("Commit failed: {}", e))
            };
        }
    };

    let mut tag_name = None;
    if policy.create_waypoint_tags {
        let name = format!("{}/{}", project_slug, waypoint.id);
        let tag = vcs.tag(&name, &format!("Completed waypoint: {}", waypoint.title)).await;
        if tag.success {
            tag_name = Some(name);
        } else {
            log::warn!("Tag {} not created: {}", name, tag.message);
            result_message.push_str(&format!(" ({})", tag.message));
        }
    }

    waypoint.mark_complete();
    log::info!("Waypoint {} passed the commit gate: {}", waypoint.id, result_message);

    CommitResult {
        committed: true,
        message: result_message,
        commit_hash,
        tag_name,
        initialized_repo,
    }
}

/// Outcome of a rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackResult {
    pub success: bool,
    pub message: String,
    pub target: Option<String>,
    pub plan_reloaded: bool,
}

impl RollbackResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            target: None,
            plan_reloaded: false,
        }
    }
}

pub const NO_ROLLBACK_REF_MESSAGE: &str = "No rollback reference available. Create a rollback anchor with \
     `git add -A && git commit -m \"checkpoint: safe rollback anchor\"`.";

/// Hard reset to `git_ref` (HEAD when absent), then reload the plan.
///
/// A loader error is logged and reported as `plan_reloaded = false`; the
/// reset itself has already happened by then.
pub async fn rollback_to_ref<F>(vcs: &dyn Vcs, git_ref: Option<&str>, plan_loader: F) -> RollbackResult
where
    F: FnOnce() -> Result<()>,
{
    if !vcs.is_repo().await {
        return RollbackResult::failed("Not a git repository");
    }

    let requested = git_ref.map(str::trim).filter(|r| !r.is_empty());
    let (target, label) = match requested {
        Some(r) => (r.to_string(), r.to_string()),
        None => match vcs.head_commit().await {
            Some(hash) => ("HEAD".to_string(), format!("HEAD ({})", hash)),
            None => return RollbackResult::failed(NO_ROLLBACK_REF_MESSAGE),
        },
    };

    let reset = vcs.reset_hard(&target).await;
    if !reset.success {
        log::error!("Rollback to {} failed: {}", target, reset.message);
        return RollbackResult::failed(format!("Rollback failed: {}", reset.message));
    }

    let plan_reloaded = match plan_loader() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Rolled back but failed to reload flight plan: {}", e);
            false
        }
    };

    RollbackResult {
        success: true,
        message: format!("Rolled back to {}", label),
        target: Some(target),
        plan_reloaded,
    }
}

/// Roll back to a waypoint tag such as `{slug}/{id}`
pub async fn rollback_to_tag<F>(vcs: &dyn Vcs, tag: &str, plan_loader: F) -> RollbackResult
where
    F: FnOnce() -> Result<()>,
{
    rollback_to_ref(vcs, Some(tag), plan_loader).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlyError;
    use crate::git::receipt::{ChecklistItem, ChecklistReceipt, FsReceiptStore, ItemStatus};
    use crate::git::service::GitResult;
    use crate::domain::WaypointStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeVcs {
        repo: Mutex<bool>,
        head: Option<String>,
        nothing_to_commit: bool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeVcs {
        fn repo() -> Self {
            Self {
                repo: Mutex::new(true),
                head: Some("abc1234".into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Vcs for FakeVcs {
        async fn is_repo(&self) -> bool {
            *self.repo.lock().unwrap()
        }
        async fn init(&self) -> GitResult {
            self.record("init".into());
            *self.repo.lock().unwrap() = true;
            GitResult::ok("Initialized git repository")
        }
        async fn stage_all(&self) -> GitResult {
            self.record("stage".into());
            GitResult::ok("Staged all changes")
        }
        async fn commit(&self, message: &str) -> CommitOutcome {
            self.record(format!("commit {}", message));
            if self.nothing_to_commit {
                CommitOutcome::NothingToCommit
            } else {
                CommitOutcome::Committed { hash: self.head.clone() }
            }
        }
        async fn head_commit(&self) -> Option<String> {
            self.head.clone()
        }
        async fn tag(&self, name: &str, _message: &str) -> GitResult {
            self.record(format!("tag {}", name));
            GitResult::ok(format!("Created tag: {}", name))
        }
        async fn reset_hard(&self, target: &str) -> GitResult {
            self.record(format!("reset {}", target));
            GitResult::ok(format!("Reset to {}", target))
        }
    }

    fn write_receipt(root: &Path, id: &str, status: ItemStatus) {
        let receipt = ChecklistReceipt {
            waypoint_id: id.to_string(),
            completed_at: Utc::now(),
            context: None,
            checklist: vec![ChecklistItem::new("test", status)],
            soft_checklist: vec![],
            criteria_verification: vec![],
        };
        receipt
            .save(&FsReceiptStore::receipt_path(root, id, Utc::now()))
            .unwrap();
    }

    #[tokio::test]
    async fn test_auto_commit_disabled() {
        let dir = TempDir::new().unwrap();
        let vcs = FakeVcs::repo();
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let policy = GitPolicy {
            auto_commit: false,
            ..GitPolicy::default()
        };
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &policy, &vcs, &FsReceiptStore).await;
        assert!(!result.committed);
        assert_eq!(result.message, "Auto-commit disabled");
        assert!(vcs.calls().is_empty());
        assert_eq!(wp.status, WaypointStatus::Pending);
    }

    #[tokio::test]
    async fn test_not_repo_without_auto_init() {
        let dir = TempDir::new().unwrap();
        let vcs = FakeVcs::default();
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let policy = GitPolicy {
            auto_init: false,
            run_checklist: false,
            ..GitPolicy::default()
        };
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &policy, &vcs, &FsReceiptStore).await;
        assert_eq!(result.message, "Not a git repo and auto-init disabled");
    }

    #[tokio::test]
    async fn test_missing_receipt_refused_outside_a_repo() {
        let dir = TempDir::new().unwrap();
        for auto_init in [false, true] {
            let vcs = FakeVcs::default();
            let mut wp = Waypoint::new("WP-1", "Auth", "o");
            let policy = GitPolicy {
                auto_init,
                ..GitPolicy::default()
            };
            let result = commit_waypoint(dir.path(), "proj", &mut wp, &policy, &vcs, &FsReceiptStore).await;
            assert!(!result.committed);
            assert_eq!(result.message, "No receipt found for WP-1");
            assert!(!result.initialized_repo);
            assert!(vcs.calls().is_empty());
            assert_eq!(wp.status, WaypointStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_missing_receipt_blocks_commit() {
        let dir = TempDir::new().unwrap();
        let vcs = FakeVcs::repo();
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &GitPolicy::default(), &vcs, &FsReceiptStore).await;
        assert!(!result.committed);
        assert_eq!(result.message, "No receipt found for WP-1");
        assert!(!vcs.calls().iter().any(|c| c.starts_with("commit")));
        assert_eq!(wp.status, WaypointStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_receipt_blocks_commit() {
        let dir = TempDir::new().unwrap();
        write_receipt(dir.path(), "WP-1", ItemStatus::Failed);
        let vcs = FakeVcs::repo();
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &GitPolicy::default(), &vcs, &FsReceiptStore).await;
        assert_eq!(result.message, "Receipt invalid: Checklist failed: test");
        assert!(vcs.calls().is_empty());
    }

    #[tokio::test]
    async fn test_valid_receipt_commits_and_tags() {
        let dir = TempDir::new().unwrap();
        write_receipt(dir.path(), "WP-1", ItemStatus::Passed);
        let vcs = FakeVcs::repo();
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &GitPolicy::default(), &vcs, &FsReceiptStore).await;
        assert!(result.committed);
        assert_eq!(result.commit_hash.as_deref(), Some("abc1234"));
        assert_eq!(result.tag_name.as_deref(), Some("proj/WP-1"));
        assert_eq!(
            vcs.calls(),
            vec!["stage", "commit feat(proj): Complete Auth", "tag proj/WP-1"]
        );
        assert_eq!(wp.status, WaypointStatus::Complete);
        assert!(wp.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_auto_init_then_nothing_to_commit() {
        let dir = TempDir::new().unwrap();
        let vcs = FakeVcs {
            nothing_to_commit: true,
            ..FakeVcs::default()
        };
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let policy = GitPolicy {
            run_checklist: false,
            ..GitPolicy::default()
        };
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &policy, &vcs, &FsReceiptStore).await;
        assert!(result.initialized_repo);
        assert!(!result.committed);
        assert_eq!(result.message, "Nothing to commit");
        assert!(result.tag_name.is_none());
        assert_eq!(vcs.calls(), vec!["init", "stage", "commit feat(proj): Complete Auth"]);
        assert_eq!(wp.status, WaypointStatus::Pending);
    }

    #[tokio::test]
    async fn test_nothing_to_commit_skips_tag_with_valid_receipt() {
        let dir = TempDir::new().unwrap();
        write_receipt(dir.path(), "WP-1", ItemStatus::Passed);
        let vcs = FakeVcs {
            nothing_to_commit: true,
            ..FakeVcs::repo()
        };
        let mut wp = Waypoint::new("WP-1", "Auth", "o");
        let result = commit_waypoint(dir.path(), "proj", &mut wp, &GitPolicy::default(), &vcs, &FsReceiptStore).await;
        assert!(!result.committed);
        assert!(result.tag_name.is_none());
        assert!(!vcs.calls().iter().any(|c| c.starts_with("tag")));
        assert_eq!(wp.status, WaypointStatus::Pending);
    }

    #[tokio::test]
    async fn test_rollback_defaults_to_head() {
        let vcs = FakeVcs::repo();
        let result = rollback_to_ref(&vcs, None, || Ok(())).await;
        assert!(result.success);
        assert_eq!(result.message, "Rolled back to HEAD (abc1234)");
        assert!(result.plan_reloaded);
        assert_eq!(vcs.calls(), vec!["reset HEAD"]);
    }

    #[tokio::test]
    async fn test_rollback_trims_ref_and_reports_loader_failure() {
        let vcs = FakeVcs::repo();
        let result = rollback_to_tag(&vcs, "  proj/WP-1 \n", || {
            Err(FlyError::Storage("plan missing".into()))
        })
        .await;
        assert!(result.success);
        assert_eq!(result.target.as_deref(), Some("proj/WP-1"));
        assert!(!result.plan_reloaded);
    }

    #[tokio::test]
    async fn test_rollback_without_anchor() {
        let vcs = FakeVcs {
            repo: Mutex::new(true),
            ..FakeVcs::default()
        };
        let result = rollback_to_ref(&vcs, Some("  "), || Ok(())).await;
        assert!(!result.success);
        assert_eq!(result.message, NO_ROLLBACK_REF_MESSAGE);

        let result = rollback_to_ref(&FakeVcs::default(), None, || Ok(())).await;
        assert_eq!(result.message, "Not a git repository");
    }
}
