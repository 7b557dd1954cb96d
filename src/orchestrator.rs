//! Orchestrator (§4.5): the top-level state machine.
//!
//! ```text
//! idle → preflight → plan-ready → running → {completed | failed | interrupted}
//!           └─────── fail fast on preflight error
//! ```
//!
//! Everything else in this crate is a pure or narrowly-scoped component;
//! the orchestrator is where they're wired together and where the only
//! ambient process state (cwd, signals) enters, via [`ProcessContext`]
//! rather than hidden globals (§9).

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::ProjectConfig;
use crate::error::DagworkError;
use crate::graph::Graph;
use crate::ids::{ItemId, RunId};
use crate::model::{RunMode, RunState, RunStatus, WorkItem};
use crate::scheduler::{EventSink, Executor, ExecOutcome, Policy, Scheduler};
use crate::store::RunStore;
use crate::tracker::Tracker;
use crate::vcs::VcsDriver;
use crate::worker::WorkerAdapter;
use crate::worktree::WorktreeManager;

/// Ambient process state threaded through explicitly rather than read from
/// hidden globals (§9): the repository root, and a signal to watch for
/// graceful shutdown.
pub struct ProcessContext {
    pub repo_root: PathBuf,
    pub shutdown: watch::Receiver<bool>,
}

/// Everything the orchestrator needs beyond process context: the concrete
/// collaborators for this run.
pub struct Orchestrator<D, W> {
    config: ProjectConfig,
    store: RunStore,
    worktree: Arc<WorktreeManager<D>>,
    worker: Arc<W>,
    tracker: Option<Arc<dyn Tracker + Send + Sync>>,
    concurrency: usize,
    policy: Policy,
}

/// The outcome of a full orchestrator run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed: BTreeSet<ItemId>,
    pub failed: BTreeSet<ItemId>,
}

impl<D, W> Orchestrator<D, W>
where
    D: VcsDriver + Send + Sync + 'static,
    W: WorkerAdapter + 'static,
{
    #[must_use]
    pub fn new(
        config: ProjectConfig,
        store: RunStore,
        worktree: WorktreeManager<D>,
        worker: W,
        tracker: Option<Arc<dyn Tracker + Send + Sync>>,
    ) -> Self {
        let concurrency = config.run.concurrency as usize;
        let policy = config.run.on_error;
        Self {
            config,
            store,
            worktree: Arc::new(worktree),
            worker: Arc::new(worker),
            tracker,
            concurrency,
            policy,
        }
    }

    #[must_use]
    pub const fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Preflight: clean-tree check, ensure the state directory exists and
    /// is ignored, record the original branch.
    ///
    /// # Errors
    /// Returns [`DagworkError::Precondition`] or [`DagworkError::Vcs`] if
    /// any check fails. No mutation happens before every check passes.
    pub fn preflight(&self, ctx: &ProcessContext) -> Result<String, DagworkError> {
        self.worktree.ensure_clean(&self.config.state.allowed_dirty)?;
        ensure_state_dir_ignored(&ctx.repo_root, &self.config.state.dir_name)?;
        Ok(self.worktree.current_branch()?)
    }

    /// Build a fresh run from `items`, create the run branch, persist the
    /// initial `RunState`, and drive it to completion.
    ///
    /// # Errors
    /// Returns [`DagworkError`] on preflight failure or store corruption.
    /// Worker/VCS failures inside the scheduler are recorded as task
    /// failures, not propagated here.
    pub async fn start(
        &self,
        ctx: &ProcessContext,
        items: Vec<WorkItem>,
        mode: RunMode,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, DagworkError> {
        let original_branch = self.preflight(ctx)?;

        let graph = Graph::build(&items)
            .map_err(|e| DagworkError::Precondition(e.to_string()))?;

        let run_id = RunId::generate();
        let run_branch = self.worktree.create_run_branch(
            &run_id,
            &original_branch,
            &self.config.repo.branch_prefix,
        )?;

        let mut run_state = RunState::new(
            run_id.clone(),
            mode,
            original_branch.clone(),
            run_branch,
            items,
        );
        self.persist(&mut run_state)?;

        self.drive(ctx, &mut run_state, &graph, &original_branch, sink).await
    }

    /// Resume a previously persisted, non-terminal run.
    ///
    /// # Errors
    /// Returns [`DagworkError::Precondition`] if the run is unknown or
    /// already terminal.
    pub async fn resume(
        &self,
        ctx: &ProcessContext,
        run_id: &RunId,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, DagworkError> {
        let mut run_state = self
            .store
            .load_run(run_id)
            .map_err(|e| DagworkError::Store(e.to_string()))?;

        if run_state.status.is_terminal() {
            return Err(DagworkError::Precondition(format!(
                "run `{run_id}` is already {:?}; nothing to resume",
                run_state.status
            )));
        }

        let original_branch = run_state.base_branch.clone();
        let graph = Graph::build(&run_state.items)
            .map_err(|e| DagworkError::Precondition(e.to_string()))?;

        run_state.reset_failed_tasks();
        run_state.set_status(RunStatus::Running);
        self.persist(&mut run_state)?;

        self.drive(ctx, &mut run_state, &graph, &original_branch, sink).await
    }

    async fn drive(
        &self,
        ctx: &ProcessContext,
        run_state: &mut RunState,
        graph: &Graph,
        original_branch: &str,
        sink: &dyn EventSink,
    ) -> Result<RunOutcome, DagworkError> {
        let scheduler = Scheduler::new(graph.clone(), self.concurrency, self.policy);
        let executor = self.make_executor(run_state, graph);

        let tracker_refs: std::collections::BTreeMap<ItemId, u64> = if self.tracker.is_some() {
            run_state.items.iter().filter_map(|i| i.external_ref.map(|r| (i.id, r))).collect()
        } else {
            std::collections::BTreeMap::new()
        };
        let tracker = self.tracker.as_deref();

        let outcome = scheduler
            .run(
                run_state.completed_ids.clone(),
                run_state.failed_ids.clone(),
                executor,
                &RecordingSink {
                    inner: sink,
                    run: std::sync::Mutex::new(&mut *run_state),
                    tracker,
                    tracker_refs: &tracker_refs,
                },
                ctx.shutdown.clone(),
            )
            .await;

        // `RecordingSink` mutated `run_state` through interior mutability on
        // every event; re-derive the final sets here for the summary.
        run_state.completed_ids = outcome.completed.clone();
        run_state.failed_ids = outcome.failed.clone();

        if *ctx.shutdown.borrow() {
            run_state.set_status(RunStatus::Interrupted);
            self.persist(run_state)?;
            self.worktree.restore_branch(original_branch)?;
            return Ok(RunOutcome {
                run_id: run_state.id.clone(),
                status: run_state.status,
                completed: outcome.completed,
                failed: outcome.failed,
            });
        }

        if outcome.failed.is_empty() && !outcome.completed.is_empty() {
            self.worktree.merge_run_branch(&run_state.run_branch, original_branch)?;
        }

        let status = if outcome.failed.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        run_state.set_status(status);
        self.persist(run_state)?;

        Ok(RunOutcome {
            run_id: run_state.id.clone(),
            status,
            completed: outcome.completed,
            failed: outcome.failed,
        })
    }

    /// Build the per-item executor closure the scheduler drives: creates a
    /// worktree, invokes the worker adapter, and reports prior-dependency
    /// summaries for items that declare dependencies.
    fn make_executor(&self, run_state: &RunState, graph: &Graph) -> Executor {
        let worker = Arc::clone(&self.worker);
        let items: std::collections::BTreeMap<ItemId, WorkItem> =
            run_state.items.iter().map(|i| (i.id, i.clone())).collect();
        let run_id = run_state.id.clone();
        let run_branch = run_state.run_branch.clone();
        let graph = graph.clone();
        let summaries: Arc<std::sync::Mutex<std::collections::BTreeMap<ItemId, String>>> =
            Arc::new(std::sync::Mutex::new(std::collections::BTreeMap::new()));

        Arc::new(move |id, cancel| {
            let worker = Arc::clone(&worker);
            let item = items[&id].clone();
            let run_id = run_id.clone();
            let run_branch = run_branch.clone();
            let deps = graph.dependencies(id);
            let summaries = Arc::clone(&summaries);

            Box::pin(async move {
                let prior_work = {
                    let collected = summaries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    let mut parts: Vec<String> = Vec::new();
                    for dep in &deps {
                        if let Some(summary) = collected.get(dep) {
                            parts.push(summary.clone());
                        }
                    }
                    (!parts.is_empty()).then(|| parts.join("\n\n---\n\n"))
                };

                let outcome = worker.execute(item, run_id, run_branch, prior_work, cancel).await?;

                if let Some(summary) = &outcome.summary {
                    summaries
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert(id, summary.clone());
                }

                Ok(ExecOutcome { commits: outcome.commits, summary: outcome.summary })
            })
        })
    }

    fn persist(&self, run_state: &mut RunState) -> Result<(), DagworkError> {
        save_with_retry(&self.store, run_state)
    }

    /// `clean`: remove all persisted state, worktrees, and run branches.
    /// Never touches in-progress VCS refs beyond what's registered.
    ///
    /// # Errors
    /// Returns [`DagworkError::Vcs`] if a registered worktree cannot be
    /// torn down, or [`DagworkError::Store`] if the registry is unreadable.
    pub fn clean(&self) -> Result<(), DagworkError> {
        let worktrees = self.store.load_worktrees().map_err(|e| DagworkError::Store(e.to_string()))?;
        for info in &worktrees {
            self.worktree.remove_worktree(info)?;
        }

        for run_id in self.store.list_run_ids().map_err(|e| DagworkError::Store(e.to_string()))? {
            if let Ok(run_state) = self.store.load_run(&run_id) {
                self.worktree.delete_branch(&run_state.run_branch)?;
            }
        }

        self.store.wipe().map_err(|e| DagworkError::Store(e.to_string()))?;
        Ok(())
    }
}

/// Persist `run_state`, retrying once on failure before treating it as
/// terminal (§7: "Store errors at write time are logged and retried once").
fn save_with_retry(store: &RunStore, run_state: &RunState) -> Result<(), DagworkError> {
    match store.save_run(run_state) {
        Ok(()) => Ok(()),
        Err(first) => {
            tracing::warn!(error = %first, "run store write failed, retrying once");
            store.save_run(run_state).map_err(|second| DagworkError::Store(second.to_string()))
        }
    }
}

/// Ensure `<repo_root>/.gitignore` lists the state directory, appending a
/// line if it's missing (mirrors the teacher's init-time gitignore patch).
fn ensure_state_dir_ignored(repo_root: &std::path::Path, dir_name: &str) -> Result<(), DagworkError> {
    let gitignore_path = repo_root.join(".gitignore");
    let pattern = format!("{dir_name}/");

    let existing = std::fs::read_to_string(&gitignore_path).unwrap_or_default();
    let already_ignored = existing.lines().any(|line| {
        let line = line.trim();
        line == dir_name || line == pattern || line == format!("/{dir_name}") || line == format!("/{pattern}")
    });
    if already_ignored {
        return Ok(());
    }

    let separator = if existing.is_empty() || existing.ends_with('\n') { "" } else { "\n" };
    let updated = format!("{existing}{separator}\n# dagwork state\n{pattern}\n");
    std::fs::write(&gitignore_path, updated)
        .map_err(|e| DagworkError::Precondition(format!("failed to update .gitignore: {e}")))
}

/// Wraps the caller's sink to also mutate the live `RunState` as events
/// arrive, keeping the persisted view current without the scheduler
/// needing to know about `RunState` at all. In tracker mode (§4.5), also
/// writes back the task's status label and, on failure, posts an
/// explanatory comment to the item's issue.
struct RecordingSink<'a> {
    inner: &'a dyn EventSink,
    run: std::sync::Mutex<&'a mut RunState>,
    tracker: Option<&'a (dyn Tracker + Send + Sync)>,
    tracker_refs: &'a std::collections::BTreeMap<ItemId, u64>,
}

impl RecordingSink<'_> {
    fn write_back(&self, item_id: ItemId, label: &str) {
        let Some(tracker) = self.tracker else { return };
        let Some(&issue) = self.tracker_refs.get(&item_id) else { return };
        if let Err(e) = tracker.set_label(issue, label) {
            tracing::warn!(error = %e, issue, "failed to write back tracker status label");
        }
    }
}

impl EventSink for RecordingSink<'_> {
    fn on_event(&self, event: &crate::scheduler::Event) {
        use crate::scheduler::Event;
        {
            let mut run = self.run.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            match event {
                Event::TaskStarted { item_id } => run.start_task(*item_id),
                Event::TaskCompleted { item_id, commits, summary } => {
                    run.complete_task(*item_id, commits.clone(), summary.clone());
                }
                Event::TaskFailed { item_id, error } => run.fail_task(*item_id, error.clone()),
                Event::TasksUnblocked { .. } | Event::RunAborted => {}
            }
        }

        match event {
            Event::TaskStarted { item_id } => self.write_back(*item_id, "in-progress"),
            Event::TaskCompleted { item_id, .. } => self.write_back(*item_id, "done"),
            Event::TaskFailed { item_id, error } => {
                self.write_back(*item_id, "failed");
                if let Some(tracker) = self.tracker
                    && let Some(&issue) = self.tracker_refs.get(item_id)
                    && let Err(e) = tracker.post_comment(
                        issue,
                        &format!("dagwork: this item failed and was left unmerged:\n\n```\n{error}\n```"),
                    )
                {
                    tracing::warn!(error = %e, issue, "failed to post tracker failure comment");
                }
            }
            Event::TasksUnblocked { .. } | Event::RunAborted => {}
        }

        self.inner.on_event(event);
    }
}
