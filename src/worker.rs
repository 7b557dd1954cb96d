//! Worker Adapter (§4.4): invokes the external agent and observes its
//! merge-back.
//!
//! The default implementation treats the agent as an opaque subprocess: it
//! writes the worker-contract input files, spawns the configured command,
//! waits for it to exit, then verifies and reports on what it did. No
//! reasoning happens here — that is the external agent's job.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng as _;

use crate::ids::RunId;
use crate::model::item::WorkItem;
use crate::model::worktree_info::WorktreeInfo;
use crate::scheduler::CancelSignal;
use crate::vcs::VcsDriver;
use crate::worktree::WorktreeManager;

/// What a worker produced on success.
#[derive(Clone, Debug, Default)]
pub struct WorkOutcome {
    pub commits: Vec<String>,
    pub summary: Option<String>,
}

pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<WorkOutcome, String>> + Send>>;

/// Narrow interface the orchestrator drives; `self: Arc<Self>` so the
/// scheduler's boxed executor future can own a cheap handle to it.
pub trait WorkerAdapter: Send + Sync {
    fn execute(
        self: Arc<Self>,
        item: WorkItem,
        run_id: RunId,
        run_branch: String,
        prior_work: Option<String>,
        cancel: CancelSignal,
    ) -> WorkerFuture;
}

/// How many times, and with what backoff, to retry a not-yet-verified
/// worker merge before giving up — concurrent worker merges into the same
/// run branch can race each other (§9 Open Questions).
#[derive(Clone, Copy, Debug)]
pub struct MergeRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for MergeRetry {
    fn default() -> Self {
        Self { attempts: 5, base_delay: Duration::from_millis(200) }
    }
}

/// The in-scope, process-spawning [`WorkerAdapter`] (§4.4).
pub struct ProcessWorkerAdapter<D> {
    worktree: Arc<WorktreeManager<D>>,
    agent_command: String,
    agent_args: Vec<String>,
    merge_retry: MergeRetry,
}

impl<D> ProcessWorkerAdapter<D> {
    #[must_use]
    pub fn new(worktree: WorktreeManager<D>, agent_command: impl Into<String>) -> Self {
        Self {
            worktree: Arc::new(worktree),
            agent_command: agent_command.into(),
            agent_args: Vec::new(),
            merge_retry: MergeRetry::default(),
        }
    }

    #[must_use]
    pub fn with_agent_args(mut self, args: Vec<String>) -> Self {
        self.agent_args = args;
        self
    }

    #[must_use]
    pub const fn with_merge_retry(mut self, retry: MergeRetry) -> Self {
        self.merge_retry = retry;
        self
    }
}

impl<D: VcsDriver + Send + Sync + 'static> ProcessWorkerAdapter<D> {
    async fn execute_inner(
        &self,
        item: WorkItem,
        run_id: RunId,
        run_branch: String,
        prior_work: Option<String>,
        cancel: CancelSignal,
    ) -> Result<WorkOutcome, String> {
        let info = {
            let worktree = Arc::clone(&self.worktree);
            let run_id = run_id.clone();
            let run_branch = run_branch.clone();
            let item_id = item.id;
            tokio::task::spawn_blocking(move || worktree.create_worktree(&run_id, item_id, &run_branch))
                .await
                .map_err(|e| format!("worktree creation task panicked: {e}"))?
                .map_err(|e| e.to_string())?
        };

        let result =
            self.run_with_worktree(&item, &run_id, &run_branch, prior_work.as_deref(), &info, cancel).await;

        let worktree = Arc::clone(&self.worktree);
        let info_for_cleanup = info.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || worktree.remove_worktree(&info_for_cleanup)).await
        {
            tracing::warn!(error = %e, item_id = %info.item_id, "worktree cleanup task panicked");
        }

        result
    }

    async fn run_with_worktree(
        &self,
        item: &WorkItem,
        run_id: &RunId,
        run_branch: &str,
        prior_work: Option<&str>,
        info: &WorktreeInfo,
        cancel: CancelSignal,
    ) -> Result<WorkOutcome, String> {
        if item.no_work_needed {
            return self.close_without_work(info, run_branch).await;
        }

        write_contract_files(item, prior_work, &info.path)?;
        self.run_agent(item, run_id, info, cancel).await?;

        let summary = read_text_file(&info.path.join("SUMMARY.md"));
        self.verify_merge_with_retry(info, run_branch).await?;
        let commits = self.collect_commits(info, run_branch).await;

        Ok(WorkOutcome { commits, summary })
    }

    async fn close_without_work(
        &self,
        info: &WorktreeInfo,
        run_branch: &str,
    ) -> Result<WorkOutcome, String> {
        let worktree = Arc::clone(&self.worktree);
        let info = info.clone();
        let run_branch = run_branch.to_owned();
        let hash = tokio::task::spawn_blocking(move || worktree.close_without_work(&info, &run_branch))
            .await
            .map_err(|e| format!("close-without-work task panicked: {e}"))?
            .map_err(|e| e.to_string())?;
        Ok(WorkOutcome { commits: vec![hash], summary: None })
    }

    async fn run_agent(
        &self,
        item: &WorkItem,
        run_id: &RunId,
        info: &WorktreeInfo,
        mut cancel: CancelSignal,
    ) -> Result<(), String> {
        if *cancel.borrow() {
            return Err("cancelled before agent start".to_owned());
        }

        let mut child = tokio::process::Command::new(&self.agent_command)
            .args(&self.agent_args)
            .current_dir(&info.path)
            .env("DAGWORK_RUN_ID", run_id.as_str())
            .env("DAGWORK_ITEM_ID", item.id.to_string())
            .env("DAGWORK_ITEM_BRANCH", &info.branch)
            .spawn()
            .map_err(|e| format!("failed to spawn agent command `{}`: {e}", self.agent_command))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| format!("agent process wait failed: {e}"))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(format!("agent exited with {status}"))
                }
            }
            _ = cancel.changed() => {
                let _ = child.kill().await;
                Err("cancelled".to_owned())
            }
        }
    }

    async fn verify_merge_with_retry(&self, info: &WorktreeInfo, run_branch: &str) -> Result<(), String> {
        let mut attempt: u32 = 0;
        loop {
            let worktree = Arc::clone(&self.worktree);
            let info2 = info.clone();
            let run_branch2 = run_branch.to_owned();
            let result = tokio::task::spawn_blocking(move || worktree.verify_worker_merge(&info2, &run_branch2))
                .await
                .map_err(|e| format!("verify-merge task panicked: {e}"))?;

            match result {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 < self.merge_retry.attempts => {
                    attempt += 1;
                    let jitter_ms: u64 = rand::rng().random_range(0..50);
                    let delay = self.merge_retry.base_delay * attempt + Duration::from_millis(jitter_ms);
                    tracing::debug!(attempt, %err, "worker merge not yet verified, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.to_string()),
            }
        }
    }

    async fn collect_commits(&self, info: &WorktreeInfo, run_branch: &str) -> Vec<String> {
        if let Some(hash) = read_text_file(&info.path.join("MERGE_COMMIT")) {
            return vec![hash.trim().to_owned()];
        }
        let worktree = Arc::clone(&self.worktree);
        let run_branch = run_branch.to_owned();
        tokio::task::spawn_blocking(move || worktree.recent_commits(&run_branch, 1))
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default()
    }
}

impl<D: VcsDriver + Send + Sync + 'static> WorkerAdapter for ProcessWorkerAdapter<D> {
    fn execute(
        self: Arc<Self>,
        item: WorkItem,
        run_id: RunId,
        run_branch: String,
        prior_work: Option<String>,
        cancel: CancelSignal,
    ) -> WorkerFuture {
        Box::pin(async move { self.execute_inner(item, run_id, run_branch, prior_work, cancel).await })
    }
}

fn write_contract_files(item: &WorkItem, prior_work: Option<&str>, path: &Path) -> Result<(), String> {
    let item_md = format!("# {}\n\n{}\n", item.title, item.body);
    std::fs::write(path.join("ITEM.md"), item_md)
        .map_err(|e| format!("failed to write ITEM.md: {e}"))?;
    if let Some(prior) = prior_work {
        std::fs::write(path.join("PRIOR_WORK.md"), prior)
            .map_err(|e| format!("failed to write PRIOR_WORK.md: {e}"))?;
    }
    Ok(())
}

fn read_text_file(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_owned()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::GitCliDriver;
    use std::collections::BTreeSet;
    use std::process::Command as StdCommand;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git").args(args).current_dir(dir.path()).status().unwrap();
            assert!(status.success());
        };
        run(&["init", "-q", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "initial"]);
        dir
    }

    fn item(id: u32, title: &str, no_work_needed: bool) -> WorkItem {
        let iid = crate::ids::ItemId::new(id).unwrap();
        let known = BTreeSet::from([iid]);
        WorkItem::new(iid, title, "body text", [], [], no_work_needed, None, &known)
    }

    fn no_cancel() -> CancelSignal {
        tokio::sync::watch::channel(false).1
    }

    #[test]
    fn write_contract_files_writes_item_and_prior_work() {
        let dir = tempfile::tempdir().unwrap();
        let it = item(1, "Do the thing", false);
        write_contract_files(&it, Some("summary of dep"), dir.path()).unwrap();
        let item_md = std::fs::read_to_string(dir.path().join("ITEM.md")).unwrap();
        assert!(item_md.contains("Do the thing"));
        assert!(item_md.contains("body text"));
        let prior = std::fs::read_to_string(dir.path().join("PRIOR_WORK.md")).unwrap();
        assert_eq!(prior, "summary of dep");
    }

    #[test]
    fn write_contract_files_skips_prior_work_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let it = item(1, "t", false);
        write_contract_files(&it, None, dir.path()).unwrap();
        assert!(!dir.path().join("PRIOR_WORK.md").exists());
    }

    #[tokio::test]
    async fn no_work_needed_item_closes_with_empty_commit_and_advances_run_branch() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let manager = WorktreeManager::new(driver, dir.path().join(".dagwork"));
        let adapter = ProcessWorkerAdapter::new(manager, "true");

        let run_id = RunId::new("testrun1").unwrap();
        let run_branch = {
            let driver = GitCliDriver::new(dir.path().to_owned());
            driver.create_run_branch(&run_id, "main", "dagwork").unwrap()
        };

        let it = item(1, "skip me", true);
        let outcome = adapter
            .execute_inner(it, run_id, run_branch, None, no_cancel())
            .await
            .unwrap();

        assert_eq!(outcome.commits.len(), 1);
        assert!(outcome.summary.is_none());
        assert!(!dir.path().join(".dagwork/worktrees").exists()
            || std::fs::read_dir(dir.path().join(".dagwork/worktrees")).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn agent_failure_exit_code_is_reported_as_error() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let manager = WorktreeManager::new(driver, dir.path().join(".dagwork"));
        let adapter = ProcessWorkerAdapter::new(manager, "false");

        let run_id = RunId::new("testrun2").unwrap();
        let run_branch = {
            let driver = GitCliDriver::new(dir.path().to_owned());
            driver.create_run_branch(&run_id, "main", "dagwork").unwrap()
        };

        let it = item(1, "will fail", false);
        let err = adapter
            .execute_inner(it, run_id, run_branch, None, no_cancel())
            .await
            .unwrap_err();
        assert!(err.contains("agent exited"));
    }

    #[tokio::test]
    async fn cancellation_before_start_aborts_without_spawning() {
        let dir = init_repo();
        let driver = GitCliDriver::new(dir.path().to_owned());
        let manager = WorktreeManager::new(driver, dir.path().join(".dagwork"));
        let adapter = ProcessWorkerAdapter::new(manager, "sleep").with_agent_args(vec!["5".to_owned()]);

        let run_id = RunId::new("testrun3").unwrap();
        let run_branch = {
            let driver = GitCliDriver::new(dir.path().to_owned());
            driver.create_run_branch(&run_id, "main", "dagwork").unwrap()
        };

        let (tx, rx) = tokio::sync::watch::channel(false);
        tx.send(true).unwrap();

        let it = item(1, "cancel me", false);
        let err = adapter
            .execute_inner(it, run_id, run_branch, None, rx)
            .await
            .unwrap_err();
        assert!(err.contains("cancelled"));
    }
}
