//! Worktree lifecycle management (§4.2).
//!
//! A thin layer over [`VcsDriver`] that knows the fixed set of transient
//! worker-contract files and the deterministic path/branch naming scheme,
//! but nothing about runs, tasks, or scheduling.

use std::path::PathBuf;
use std::sync::Arc;

use crate::ids::{ItemId, RunId};
use crate::model::worktree_info::WorktreeInfo;
use crate::store::RunStore;
use crate::vcs::{VcsDriver, VcsError};

/// Worker-contract files removed from the target branch after a run-branch
/// merge (§6): the summary, merge marker, and the inputs the adapter wrote
/// for the worker.
pub const TRANSIENT_FILES: &[&str] = &["ITEM.md", "PRIOR_WORK.md", "SUMMARY.md", "MERGE_COMMIT"];

/// Owns the per-item worktree lifecycle on top of a [`VcsDriver`].
///
/// Optionally keeps the on-disk worktree registry (`worktrees.json`, §4.6)
/// in sync as worktrees are created and removed, so `clean` can discover
/// stale worktrees left behind by a crash that never reached teardown.
pub struct WorktreeManager<D> {
    driver: D,
    state_dir: PathBuf,
    registry: Option<Arc<RunStore>>,
}

impl<D: VcsDriver> WorktreeManager<D> {
    #[must_use]
    pub const fn new(driver: D, state_dir: PathBuf) -> Self {
        Self { driver, state_dir, registry: None }
    }

    /// Attach a run store whose worktree registry is kept current as this
    /// manager creates and removes worktrees.
    #[must_use]
    pub fn with_registry(mut self, store: Arc<RunStore>) -> Self {
        self.registry = Some(store);
        self
    }

    pub fn current_branch(&self) -> Result<String, VcsError> {
        self.driver.current_branch()
    }

    pub fn ensure_clean(&self, allowed_dirty: &[String]) -> Result<(), VcsError> {
        self.driver.ensure_clean(allowed_dirty)
    }

    pub fn create_run_branch(
        &self,
        run_id: &RunId,
        base: &str,
        prefix: &str,
    ) -> Result<String, VcsError> {
        self.driver.create_run_branch(run_id, base, prefix)
    }

    pub fn create_worktree(
        &self,
        run_id: &RunId,
        item_id: ItemId,
        run_branch: &str,
    ) -> Result<WorktreeInfo, VcsError> {
        let info = self.driver.create_worktree(&self.state_dir, run_id, item_id, run_branch)?;
        if let Some(store) = &self.registry {
            if let Err(e) = store.register_worktree(info.clone()) {
                tracing::warn!(error = %e, item_id = %item_id, "failed to register worktree in registry");
            }
        }
        Ok(info)
    }

    /// Idempotent; safe to call on an already-removed worktree.
    pub fn remove_worktree(&self, info: &WorktreeInfo) -> Result<(), VcsError> {
        let result = self.driver.remove_worktree(&info.path, Some(&info.branch));
        if let Some(store) = &self.registry {
            if let Err(e) = store.deregister_worktree(&info.run_id, info.item_id) {
                tracing::warn!(error = %e, item_id = %info.item_id, "failed to deregister worktree in registry");
            }
        }
        result
    }

    /// Same as [`Self::remove_worktree`] but for a bare path with no
    /// associated branch, used by `clean` when the registry has gone stale.
    pub fn remove_worktree_at(&self, path: &std::path::Path) -> Result<(), VcsError> {
        self.driver.remove_worktree(path, None)
    }

    pub fn verify_worker_merge(&self, info: &WorktreeInfo, run_branch: &str) -> Result<(), VcsError> {
        self.driver.verify_worker_merge(&info.branch, run_branch)
    }

    /// Merge `run_branch` into `target` and strip the transient worker
    /// contract files, matching §6's "worker contract files" list.
    pub fn merge_run_branch(&self, run_branch: &str, target: &str) -> Result<(), VcsError> {
        self.driver.merge_run_branch(run_branch, target, TRANSIENT_FILES)
    }

    pub fn restore_branch(&self, name: &str) -> Result<(), VcsError> {
        self.driver.restore_branch(name)
    }

    /// Delete a run branch that has no remaining worktree — used by
    /// `clean`.
    pub fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        self.driver.delete_branch(branch)
    }

    /// For `no_work_needed` items: close out `info`'s branch with an empty
    /// commit and fast-forward `run_branch` onto it.
    pub fn close_without_work(
        &self,
        info: &WorktreeInfo,
        run_branch: &str,
    ) -> Result<String, VcsError> {
        self.driver.close_without_work(&info.path, &info.branch, run_branch)
    }

    pub fn recent_commits(&self, run_branch: &str, limit: usize) -> Result<Vec<String>, VcsError> {
        self.driver.recent_commits(run_branch, limit)
    }
}
