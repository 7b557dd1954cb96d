//! Thin, testable wrapper over the version-control CLI (§4.2).
//!
//! [`VcsDriver`] is deliberately narrow: branch create/delete, worktree
//! add/remove, merge-base ancestry checks, and status parsing. Nothing in
//! this module knows about runs, tasks, or scheduling — those live above it.

pub mod error;
pub mod git;

pub use error::VcsError;
pub use git::GitCliDriver;

use std::path::Path;

use crate::ids::{ItemId, RunId};
use crate::model::worktree_info::WorktreeInfo;

/// Operations the orchestrator needs from the underlying VCS.
///
/// A `std::process::Command`-based implementation ([`GitCliDriver`]) is the
/// only one shipped, but tests exercise the orchestrator and scheduler
/// against hand-written fakes of this trait without touching a real
/// repository.
pub trait VcsDriver {
    /// The branch currently checked out in the primary working copy.
    fn current_branch(&self) -> Result<String, VcsError>;

    /// Refuse if the primary working copy has tracked changes outside
    /// `allowed_dirty` glob patterns. Untracked-but-ignored files are
    /// always allowed.
    fn ensure_clean(&self, allowed_dirty: &[String]) -> Result<(), VcsError>;

    /// Create `<prefix>/run-<runId>` pointing at the tip of `base`, without
    /// switching the primary working copy onto it.
    fn create_run_branch(&self, run_id: &RunId, base: &str, prefix: &str)
        -> Result<String, VcsError>;

    /// Create an isolated working copy at a deterministic path under
    /// `state_dir`, on a fresh branch forked from `run_branch`. Tears down
    /// any prior same-named artifacts first.
    fn create_worktree(
        &self,
        state_dir: &Path,
        run_id: &RunId,
        item_id: ItemId,
        run_branch: &str,
    ) -> Result<WorktreeInfo, VcsError>;

    /// Idempotent worktree removal; falls back to filesystem delete + prune
    /// if the VCS tooling refuses.
    fn remove_worktree(&self, path: &Path, branch: Option<&str>) -> Result<(), VcsError>;

    /// Verify that `branch`'s tip is an ancestor of `run_branch`'s tip.
    ///
    /// # Errors
    /// Returns [`VcsError::MergeNotVerified`] if it is not — the caller
    /// should treat this as a task failure, not a crash.
    fn verify_worker_merge(&self, branch: &str, run_branch: &str) -> Result<(), VcsError>;

    /// Switch to `target` and merge `run_branch` with a standard,
    /// non-editing merge commit, then remove `transient_files` relative to
    /// the repo root with a follow-up cleanup commit if any existed.
    fn merge_run_branch(
        &self,
        run_branch: &str,
        target: &str,
        transient_files: &[&str],
    ) -> Result<(), VcsError>;

    /// Abort any in-progress merge/rebase, discard dirty working-tree
    /// edits, and switch back to `name`. Must be safe to call when there is
    /// nothing to undo.
    fn restore_branch(&self, name: &str) -> Result<(), VcsError>;

    /// Last `limit` commit subjects reachable from `run_branch`, newest
    /// first, for diagnostics on a failed [`Self::verify_worker_merge`].
    fn recent_commits(&self, run_branch: &str, limit: usize) -> Result<Vec<String>, VcsError>;

    /// For items flagged `no_work_needed`: create an empty commit on
    /// `branch` (checked out at `worktree_path`) and fast-forward
    /// `run_branch` onto it. Returns the resulting commit hash.
    fn close_without_work(
        &self,
        worktree_path: &Path,
        branch: &str,
        run_branch: &str,
    ) -> Result<String, VcsError>;

    /// Delete `branch` outright, with no associated worktree. Idempotent:
    /// deleting an already-gone branch is not an error. Used by `clean` to
    /// remove run branches once their worktrees are torn down.
    fn delete_branch(&self, branch: &str) -> Result<(), VcsError>;
}
