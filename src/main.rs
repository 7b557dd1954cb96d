use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use dagwork::config::ProjectConfig;
use dagwork::ids::RunId;
use dagwork::model::{RunMode, RunState};
use dagwork::orchestrator::{Orchestrator, ProcessContext};
use dagwork::planner::{FallbackAnalyzer, Planner};
use dagwork::scheduler::Policy;
use dagwork::sink::{Display as SinkDisplay, LineSink};
use dagwork::store::RunStore;
use dagwork::tracker::{GhCliTracker, Tracker};
use dagwork::vcs::GitCliDriver;
use dagwork::worker::ProcessWorkerAdapter;
use dagwork::worktree::WorktreeManager;

/// DAG-driven parallel agent orchestrator.
///
/// dagwork decomposes a plan or issue list into interdependent work items,
/// schedules them respecting their dependency graph, and runs each one in
/// an isolated git worktree on its own branch. Each worker is expected to
/// merge its own branch back into the run's integration branch; dagwork
/// verifies the merge, collects commits and summaries, and finally merges
/// the whole run back onto the branch it started from.
///
/// QUICK START:
///
///   dagwork run PLAN.md
///   dagwork status
///   dagwork resume <run-id>
#[derive(Parser)]
#[command(name = "dagwork")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a plan (or fetch tracker issues) and run it
    Run(RunArgs),

    /// Resume a previously interrupted or partially-failed run
    Resume(ResumeArgs),

    /// Show the status of one or all persisted runs
    Status(StatusArgs),

    /// Remove all persisted state, worktrees, and run branches
    Clean,
}

#[derive(clap::Args)]
struct RunArgs {
    /// A plan file path, or a comma-separated list of tracker issue numbers
    /// (e.g. `12,14,15`). Omit to use the most recently persisted worklist.
    source: Option<String>,

    /// Maximum number of work items running concurrently
    #[arg(long)]
    concurrency: Option<u32>,

    /// How the terminal progress view renders events
    #[arg(long, value_enum, default_value = "detailed")]
    display: DisplayArg,

    /// Parse and schedule, but never touch the VCS or run-state on disk
    #[arg(long)]
    dry_run: bool,

    /// Stop scheduling new work after the first failure
    #[arg(long)]
    stop_on_error: bool,

    /// Forwarded to the agent command as-is; the adapter does not interpret it
    #[arg(long)]
    dangerously_skip_permissions: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DisplayArg {
    Compact,
    Detailed,
}

#[derive(clap::Args)]
struct ResumeArgs {
    run_id: String,
}

#[derive(clap::Args)]
struct StatusArgs {
    #[arg(long = "run-id")]
    run_id: Option<String>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = dagwork::telemetry::init();

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let code = runtime.block_on(dispatch(cli));
    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let repo_root = std::env::current_dir().context("failed to determine current directory")?;
    let config = ProjectConfig::load(&repo_root.join(".dagwork.toml"))
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("failed to load .dagwork.toml")?;

    match cli.command {
        Commands::Run(args) => run_command(repo_root, config, args).await,
        Commands::Resume(args) => resume_command(repo_root, config, args).await,
        Commands::Status(args) => status_command(repo_root, config, args),
        Commands::Clean => clean_command(repo_root, config),
    }
}

fn make_orchestrator(
    repo_root: PathBuf,
    config: ProjectConfig,
    tracker: Option<Arc<dyn Tracker + Send + Sync>>,
) -> Orchestrator<GitCliDriver, ProcessWorkerAdapter<GitCliDriver>> {
    let state_dir = repo_root.join(&config.state.dir_name);
    let store = RunStore::new(state_dir.clone());
    let registry = Arc::new(RunStore::new(state_dir.clone()));

    let worktree = WorktreeManager::new(GitCliDriver::new(repo_root.clone()), state_dir.clone());
    let worker_worktree =
        WorktreeManager::new(GitCliDriver::new(repo_root), state_dir).with_registry(registry);
    let worker = ProcessWorkerAdapter::new(worker_worktree, config.run.agent_command.clone());

    Orchestrator::new(config, store, worktree, worker, tracker)
}

/// Build a tracker handle for tracker-mode runs, `None` otherwise — matches
/// the write-back path `RecordingSink` uses for status labels and failure
/// comments (§4.5).
fn tracker_for_mode(
    mode: RunMode,
    repo_root: &std::path::Path,
    config: &ProjectConfig,
) -> Option<Arc<dyn Tracker + Send + Sync>> {
    match mode {
        RunMode::Tracker => Some(Arc::new(GhCliTracker::new(
            repo_root.to_owned(),
            config.tracker.token_env.clone(),
        ))),
        RunMode::Plan => None,
    }
}

/// Install a shutdown watch, flipped on Ctrl-C (and `SIGTERM` on Unix).
/// Idempotent: repeated signals after the first have no additional effect
/// since the watch channel simply stays at `true`.
fn install_shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return,
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        let _ = tx.send(true);
    });
    rx
}

async fn run_command(repo_root: PathBuf, mut config: ProjectConfig, args: RunArgs) -> Result<i32> {
    if let Some(n) = args.concurrency {
        config.run.concurrency = n;
    }
    if args.stop_on_error {
        config.run.on_error = Policy::StopOnError;
    }
    if args.dangerously_skip_permissions {
        config.run.agent_command = format!("{} --dangerously-skip-permissions", config.run.agent_command);
    }

    let (mode, items) = resolve_source(&repo_root, &config, args.source.as_deref())?;

    if args.dry_run {
        print_dry_run(&items);
        return Ok(0);
    }

    let tracker = tracker_for_mode(mode, &repo_root, &config);
    let orchestrator = make_orchestrator(repo_root.clone(), config, tracker);
    let shutdown = install_shutdown_signal();
    let ctx = ProcessContext { repo_root, shutdown };
    let sink = LineSink::new(std::io::stdout(), display_of(args.display));

    let outcome = orchestrator.start(&ctx, items, mode, &sink).await?;
    Ok(exit_code_for(outcome.status))
}

async fn resume_command(repo_root: PathBuf, config: ProjectConfig, args: ResumeArgs) -> Result<i32> {
    let run_id = RunId::new(&args.run_id).context("invalid run id")?;

    let state_dir = repo_root.join(&config.state.dir_name);
    let persisted_mode = RunStore::new(state_dir)
        .load_run(&run_id)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .mode;
    let tracker = tracker_for_mode(persisted_mode, &repo_root, &config);
    let orchestrator = make_orchestrator(repo_root.clone(), config, tracker);
    let shutdown = install_shutdown_signal();
    let ctx = ProcessContext { repo_root, shutdown };
    let sink = LineSink::new(std::io::stdout(), SinkDisplay::Detailed);

    let outcome = orchestrator.resume(&ctx, &run_id, &sink).await?;
    Ok(exit_code_for(outcome.status))
}

fn status_command(repo_root: PathBuf, config: ProjectConfig, args: StatusArgs) -> Result<i32> {
    let state_dir = repo_root.join(&config.state.dir_name);
    let store = RunStore::new(state_dir);

    let run = match &args.run_id {
        Some(id) => {
            let run_id = RunId::new(id).context("invalid run id")?;
            store.load_run(&run_id).map_err(|e| anyhow::anyhow!(e.to_string()))?
        }
        None => store
            .latest_run()
            .map_err(|e| anyhow::anyhow!(e.to_string()))?
            .context("no runs found")?,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_status(&run);
    }
    Ok(0)
}

fn clean_command(repo_root: PathBuf, config: ProjectConfig) -> Result<i32> {
    let orchestrator = make_orchestrator(repo_root, config, None);
    orchestrator.clean()?;
    println!("cleaned all dagwork state, worktrees, and run branches");
    Ok(0)
}

/// Decide plan-mode vs tracker-mode from the `run` source argument, per §6:
/// a plan file path, a comma-separated list of tracker issue numbers, or
/// absence (use the latest discovered plan).
fn resolve_source(
    repo_root: &std::path::Path,
    config: &ProjectConfig,
    source: Option<&str>,
) -> Result<(RunMode, Vec<dagwork::model::WorkItem>)> {
    match source {
        Some(src) if looks_like_issue_list(src) => {
            let numbers: Vec<u64> = src.split(',').map(|s| s.trim().parse()).collect::<Result<_, _>>()?;
            let tracker = GhCliTracker::new(repo_root.to_owned(), config.tracker.token_env.clone());
            let all = tracker.fetch_open_issues().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let wanted: std::collections::BTreeSet<u64> = numbers.into_iter().collect();
            let items: Vec<_> = all.into_iter().filter(|i| i.external_ref.is_some_and(|n| wanted.contains(&n))).collect();
            if items.is_empty() {
                bail!("none of the requested issue numbers were found among open issues");
            }
            Ok((RunMode::Tracker, items))
        }
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("failed to read plan file `{path}`"))?;
            let items = FallbackAnalyzer::new().parse(&text).map_err(|e| anyhow::anyhow!(e.to_string()))?;

            let state_dir = repo_root.join(&config.state.dir_name);
            let worklist = dagwork::store::Worklist {
                version: dagwork::store::WORKLIST_SCHEMA_VERSION,
                items: items.clone(),
            };
            RunStore::new(state_dir)
                .save_worklist(&worklist)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            Ok((RunMode::Plan, items))
        }
        None => {
            let state_dir = repo_root.join(&config.state.dir_name);
            let worklist = RunStore::new(state_dir)
                .load_worklist()
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if worklist.items.is_empty() {
                bail!("no plan source given and no previously discovered worklist exists");
            }
            Ok((RunMode::Plan, worklist.items))
        }
    }
}

fn looks_like_issue_list(src: &str) -> bool {
    !src.is_empty() && src.split(',').all(|part| !part.trim().is_empty() && part.trim().chars().all(|c| c.is_ascii_digit()))
}

fn display_of(arg: DisplayArg) -> SinkDisplay {
    match arg {
        DisplayArg::Compact => SinkDisplay::Compact,
        DisplayArg::Detailed => SinkDisplay::Detailed,
    }
}

fn exit_code_for(status: dagwork::model::RunStatus) -> i32 {
    use dagwork::model::RunStatus;
    match status {
        RunStatus::Completed => 0,
        RunStatus::Interrupted => 130,
        RunStatus::Failed | RunStatus::Running => 1,
    }
}

fn print_dry_run(items: &[dagwork::model::WorkItem]) {
    println!("dry run — {} item(s) parsed, nothing executed:", items.len());
    for item in items {
        let deps: Vec<String> = item.dependencies.iter().map(ToString::to_string).collect();
        println!("  [{}] {} (deps: [{}])", item.id, item.title, deps.join(", "));
    }
}

fn print_status(run: &RunState) {
    println!("run {} ({:?}, {:?} mode)", run.id, run.status, run.mode);
    println!("  base branch: {}  run branch: {}", run.base_branch, run.run_branch);
    for task in &run.tasks {
        let marker = match task.status {
            dagwork::model::TaskStatus::Completed => "done",
            dagwork::model::TaskStatus::Failed => "FAIL",
            dagwork::model::TaskStatus::InProgress => "....",
            _ => "    ",
        };
        let detail = task.error.as_deref().map_or_else(String::new, |e| format!(" — {e}"));
        println!("  [{marker}] item {}{detail}", task.item_id);
    }
    if let Some(err) = &run.error {
        println!("error: {err}");
    }
}
