//! Top-level error type (§7).
//!
//! Every error kind named in the error-handling design gets its own
//! variant here; each carries enough detail to explain itself without the
//! caller needing additional context.

use std::fmt;

use crate::ids::RunId;
use crate::vcs::VcsError;

/// The unified error type for orchestrator operations.
#[derive(Debug)]
pub enum DagworkError {
    /// A precondition was violated before any mutation happened: a dirty
    /// tree, a cyclic dependency graph, an unknown run id, or an attempt to
    /// resume a terminal run.
    Precondition(String),

    /// The underlying VCS tool failed.
    Vcs(VcsError),

    /// A worker's item branch did not merge forward into the run branch.
    MergeVerification {
        branch: String,
        run_branch: String,
        detail: String,
        recent_commits: Vec<String>,
    },

    /// The external agent returned non-success: execution error, turn
    /// budget exhausted, or cancelled.
    Worker(String),

    /// The run store could not read or write persisted state.
    Store(String),

    /// Not really an error: an interrupt signal propagated through the
    /// shutdown handler.
    Interrupt,
}

impl fmt::Display for DagworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            Self::Vcs(err) => write!(f, "vcs error: {err}"),
            Self::MergeVerification {
                branch,
                run_branch,
                detail,
                recent_commits,
            } => {
                write!(
                    f,
                    "merge verification failed: `{branch}` did not advance `{run_branch}`: {detail}"
                )?;
                if !recent_commits.is_empty() {
                    write!(f, "\n  recent commits on {run_branch}:")?;
                    for c in recent_commits {
                        write!(f, "\n    {c}")?;
                    }
                }
                Ok(())
            }
            Self::Worker(msg) => write!(f, "worker error: {msg}"),
            Self::Store(msg) => write!(f, "run store error: {msg}"),
            Self::Interrupt => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for DagworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Vcs(err) => Some(err),
            _ => None,
        }
    }
}

impl From<VcsError> for DagworkError {
    fn from(err: VcsError) -> Self {
        Self::Vcs(err)
    }
}

/// A run id did not resolve to a persisted run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownRunError(pub RunId);

impl fmt::Display for UnknownRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no run found with id `{}`", self.0)
    }
}

impl std::error::Error for UnknownRunError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_verification_display_includes_recent_commits() {
        let err = DagworkError::MergeVerification {
            branch: "dagwork/run-abc-item-1".to_owned(),
            run_branch: "dagwork/run-abc".to_owned(),
            detail: "not an ancestor".to_owned(),
            recent_commits: vec!["abc123 fix thing".to_owned()],
        };
        let msg = err.to_string();
        assert!(msg.contains("did not advance"));
        assert!(msg.contains("abc123 fix thing"));
    }

    #[test]
    fn precondition_display() {
        let err = DagworkError::Precondition("dirty worktree".to_owned());
        assert!(err.to_string().contains("dirty worktree"));
    }
}
