//! `RunState` — the persisted record of one orchestrator run (§3, §4.6).

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, RunId};
use crate::model::item::WorkItem;
use crate::model::task::{Task, TaskStatus};
use crate::time::now_secs;

/// How a run's work items were sourced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    Plan,
    Tracker,
}

/// Terminal and non-terminal states of a run as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The durable, schema-versioned record of a single run (§3, §4.6).
///
/// Every mutation goes through the accessor methods below so the
/// `completedIds`/`failedIds` invariants can never drift from the tasks
/// themselves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    pub id: RunId,
    pub created_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub base_branch: String,
    pub run_branch: String,
    pub items: Vec<WorkItem>,
    pub tasks: Vec<Task>,
    pub completed_ids: BTreeSet<ItemId>,
    pub failed_ids: BTreeSet<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Schema version for on-disk `RunState` JSON.
pub const SCHEMA_VERSION: u32 = 1;

impl RunState {
    /// Build a fresh run state with every item queued.
    #[must_use]
    pub fn new(
        id: RunId,
        mode: RunMode,
        base_branch: impl Into<String>,
        run_branch: impl Into<String>,
        items: Vec<WorkItem>,
    ) -> Self {
        let now = crate::time::now_iso8601();
        let tasks = items.iter().map(|item| Task::queued(item.id)).collect();
        Self {
            version: SCHEMA_VERSION,
            id,
            created_at: now.clone(),
            updated_at: now,
            status: RunStatus::Running,
            mode,
            base_branch: base_branch.into(),
            run_branch: run_branch.into(),
            items,
            tasks,
            completed_ids: BTreeSet::new(),
            failed_ids: BTreeSet::new(),
            pr_url: None,
            error: None,
        }
    }

    #[must_use]
    pub fn task(&self, id: ItemId) -> Option<&Task> {
        self.tasks.iter().find(|t| t.item_id == id)
    }

    fn task_mut(&mut self, id: ItemId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.item_id == id)
    }

    #[must_use]
    pub fn item_ids(&self) -> BTreeSet<ItemId> {
        self.items.iter().map(|i| i.id).collect()
    }

    fn touch(&mut self) {
        self.updated_at = crate::time::now_iso8601();
    }

    /// Record that `id` has started.
    pub fn start_task(&mut self, id: ItemId) {
        let now = now_secs();
        if let Some(task) = self.task_mut(id) {
            task.mark_started(now);
        }
        self.touch();
    }

    /// Record that `id` completed successfully, keeping `completedIds` and
    /// the task status in lockstep.
    pub fn complete_task(&mut self, id: ItemId, commits: Vec<String>, summary: Option<String>) {
        let now = now_secs();
        if let Some(task) = self.task_mut(id) {
            task.mark_completed(now, commits, summary);
        }
        self.failed_ids.remove(&id);
        self.completed_ids.insert(id);
        self.touch();
    }

    /// Record that `id` failed, keeping `failedIds` and the task status in
    /// lockstep.
    pub fn fail_task(&mut self, id: ItemId, error: impl Into<String>) {
        let now = now_secs();
        let error = error.into();
        if let Some(task) = self.task_mut(id) {
            task.mark_failed(now, error);
        }
        self.completed_ids.remove(&id);
        self.failed_ids.insert(id);
        self.touch();
    }

    /// Reset every failed task to `queued`, clearing `failedIds` — used by
    /// resume (§4.5).
    pub fn reset_failed_tasks(&mut self) {
        for id in std::mem::take(&mut self.failed_ids) {
            if let Some(task) = self.task_mut(id) {
                task.reset_to_queued();
            }
        }
        self.touch();
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.touch();
    }

    pub fn set_pr_url(&mut self, url: impl Into<String>) {
        self.pr_url = Some(url.into());
        self.touch();
    }

    /// Check the invariants documented in §3. Intended for tests and for
    /// `status --json` sanity checks, not for hot-path validation.
    ///
    /// # Errors
    /// Returns a description of the first violated invariant found.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if !self.completed_ids.is_disjoint(&self.failed_ids) {
            return Err(InvariantViolation(
                "completedIds and failedIds overlap".to_owned(),
            ));
        }
        let item_ids = self.item_ids();
        if !self.completed_ids.is_subset(&item_ids) || !self.failed_ids.is_subset(&item_ids) {
            return Err(InvariantViolation(
                "completedIds/failedIds reference unknown item ids".to_owned(),
            ));
        }
        for task in &self.tasks {
            let in_completed = self.completed_ids.contains(&task.item_id);
            let in_failed = self.failed_ids.contains(&task.item_id);
            match task.status {
                TaskStatus::Completed if !in_completed => {
                    return Err(InvariantViolation(format!(
                        "task {} is completed but missing from completedIds",
                        task.item_id
                    )));
                }
                TaskStatus::Failed if !in_failed => {
                    return Err(InvariantViolation(format!(
                        "task {} is failed but missing from failedIds",
                        task.item_id
                    )));
                }
                _ if in_completed || in_failed => {
                    if in_completed && task.status != TaskStatus::Completed {
                        return Err(InvariantViolation(format!(
                            "task {} is in completedIds but status is {:?}",
                            task.item_id, task.status
                        )));
                    }
                    if in_failed && task.status != TaskStatus::Failed {
                        return Err(InvariantViolation(format!(
                            "task {} is in failedIds but status is {:?}",
                            task.item_id, task.status
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// An invariant of [`RunState`] was violated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation(pub String);

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run state invariant violated: {}", self.0)
    }
}

impl std::error::Error for InvariantViolation {}
