//! `WorktreeInfo` — a registry record of one active isolated working copy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, RunId};

/// One active worktree, as tracked in the worktree registry (§3, §4.6).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub item_id: ItemId,
    pub run_id: RunId,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: String,
}

impl WorktreeInfo {
    /// The deterministic worktree path for `(run_id, item_id)` under
    /// `<state-dir>/worktrees/`.
    #[must_use]
    pub fn path_for(state_dir: &std::path::Path, run_id: &RunId, item_id: ItemId) -> PathBuf {
        state_dir
            .join("worktrees")
            .join(format!("run-{run_id}-item-{item_id}"))
    }

    /// The deterministic item-branch name for `(run_branch, item_id)`.
    #[must_use]
    pub fn branch_for(run_branch: &str, item_id: ItemId) -> String {
        format!("{run_branch}-item-{item_id}")
    }
}
