//! `Task` — the mutable per-run record of one work item's progress.

use serde::{Deserialize, Serialize};

use crate::ids::ItemId;

/// The state of one item within a run (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Blocked,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-run bookkeeping for one work item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub item_id: ItemId,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commits: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Task {
    /// A freshly created task, queued and untouched.
    #[must_use]
    pub const fn queued(item_id: ItemId) -> Self {
        Self {
            item_id,
            status: TaskStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
            commits: Vec::new(),
            summary: None,
        }
    }

    pub fn mark_started(&mut self, now: u64) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
    }

    pub fn mark_completed(&mut self, now: u64, commits: Vec<String>, summary: Option<String>) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.commits = commits;
        self.summary = summary;
        self.error = None;
    }

    pub fn mark_failed(&mut self, now: u64, error: String) {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(now);
        self.error = Some(error);
    }

    /// Reset a failed task back to `queued`, as done on resume.
    pub fn reset_to_queued(&mut self) {
        self.status = TaskStatus::Queued;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.commits.clear();
        self.summary = None;
    }
}
