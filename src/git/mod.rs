//! Receipt-gated version control
//!
//! This module provides:
//! - Vcs trait and the `git` CLI implementation
//! - Checklist receipts, their builder and validator
//! - The commit gate and rollback

pub mod gate;
pub mod receipt;
pub mod service;

pub use gate::{CommitResult, GitPolicy, RollbackResult, commit_waypoint, rollback_to_ref, rollback_to_tag};
pub use receipt::{
    CapturedEvidence, Checklist, ChecklistItem, ChecklistReceipt, FsReceiptStore, ItemStatus, ReceiptBuilder,
    ReceiptStore, ReceiptValidationResult, ReceiptValidator, WaypointContext, safe_receipt_id,
};
pub use service::{CommitOutcome, GitResult, GitService, Vcs, shell_quote};
