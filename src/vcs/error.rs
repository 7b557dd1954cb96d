//! Error type for [`super::VcsDriver`] operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`super::VcsDriver`] operations.
#[derive(Debug, Error)]
pub enum VcsError {
    /// A shelled-out VCS command exited non-zero.
    #[error("`{command}` failed{}: {stderr}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// The working copy had uncommitted changes outside the allowed-dirty
    /// list.
    #[error("dirty worktree at {}: {message}", path.display())]
    DirtyWorktree { path: PathBuf, message: String },

    /// A worker's item branch did not merge forward into the run branch.
    #[error("worker merge for branch `{branch}` did not advance `{run_branch}`: {detail}")]
    MergeNotVerified {
        branch: String,
        run_branch: String,
        detail: String,
    },

    /// An I/O error occurred spawning or reading from a VCS subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
