use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use procflow::checkpoint::{
    checkpoint_path, find_checkpoint_for_taskfile, Checkpoint, CheckpointManager,
    CheckpointPersistence, FileCheckpointPersistence, FingerprintCheck,
};
use procflow::config::Config;
use procflow::exclusivity::{DirectorySessionRegistry, ExclusivityCoordinator};
use procflow::optimizer::{ContentionOptimizer, InMemoryDurationHistory};
use procflow::orchestration::{
    RetryingExecutor, RunSummary, Scheduler, SchedulerEvent, ShellRunner,
};
use procflow::{Error, Result, TaskGraph, TaskId, Taskfile};

/// Upper bound on writing the duration history at exit.
const HISTORY_SAVE_TIMEOUT: Duration = Duration::from_secs(10);

/// procflow - dependency-aware parallel runner for remote batch procedures
#[derive(Parser, Debug)]
#[command(name = "procflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PROCFLOW_LOG=procflow=debug     Log filter (overridden by --debug)")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.procflow/procflow.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a taskfile
    Run(RunArgs),

    /// Parse a taskfile and check its dependency graph
    Validate {
        /// Path to the taskfile
        taskfile: PathBuf,
    },

    /// Show checkpointed progress of a taskfile
    Status {
        /// Path to the taskfile
        taskfile: PathBuf,
    },
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Path to the taskfile
    pub taskfile: PathBuf,

    /// Maximum number of tasks in flight (overrides config)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Continue from the checkpoint left by an earlier run
    #[arg(long)]
    pub resume: bool,

    /// Continue from the checkpoint, rerunning everything from this id on
    #[arg(long, value_name = "ID", conflicts_with = "resume")]
    pub resume_from: Option<String>,

    /// Rerun tasks that were interrupted and are not marked safe_retry
    #[arg(long)]
    pub force_resume: bool,

    /// Request sole use of the target systems
    #[arg(long)]
    pub exclusive: bool,

    /// Start even if other sessions conflict
    #[arg(long)]
    pub force_exclusive: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    procflow::log::init(cli.debug);

    let result = match cli.command {
        Command::Run(args) => run_taskfile(cli.config.as_deref(), args),
        Command::Validate { taskfile } => run_validate(&taskfile).map(|_| ExitCode::SUCCESS),
        Command::Status { taskfile } => {
            run_status(cli.config.as_deref(), &taskfile).map(|_| ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Load a taskfile by its canonical path, so checkpoints written from
/// different working directories match.
fn load_taskfile(path: &Path) -> Result<Taskfile> {
    let canonical = path
        .canonicalize()
        .map_err(|e| Error::Taskfile(format!("{}: {}", path.display(), e)))?;
    Taskfile::load(&canonical)
}

/// Locate the checkpoint of an earlier run, preferring the workflow's own file.
fn locate_checkpoint(dir: &Path, taskfile: &Taskfile) -> Result<Option<Checkpoint>> {
    let own = checkpoint_path(dir, &taskfile.workflow);
    let path = if own.exists() {
        Some(own)
    } else {
        find_checkpoint_for_taskfile(dir, &taskfile.path)
    };
    match path {
        Some(path) => {
            info!(path = %path.display(), "found checkpoint");
            FileCheckpointPersistence.load(&path)
        }
        None => Ok(None),
    }
}

/// A checkpoint aligned with the resumed run, and the ids it reruns.
struct ResumeState {
    checkpoint: Checkpoint,
    to_run: BTreeSet<TaskId>,
}

fn prepare_resume(
    config: &Config,
    taskfile: &Taskfile,
    graph: &TaskGraph,
    args: &RunArgs,
) -> Result<Option<ResumeState>> {
    if !args.resume && args.resume_from.is_none() {
        return Ok(None);
    }

    let dir = config.checkpoint_dir()?;
    let Some(mut checkpoint) = locate_checkpoint(&dir, taskfile)? else {
        if let Some(id) = &args.resume_from {
            return Err(Error::Validation(format!(
                "cannot resume from '{}': no checkpoint for {}",
                id,
                taskfile.path.display()
            )));
        }
        warn!(taskfile = %taskfile.path.display(), "no checkpoint found, starting fresh");
        return Ok(None);
    };

    if checkpoint.validate_against_taskfile(&taskfile.path, config.checkpoint.strict)?
        == FingerprintCheck::Mismatch
    {
        warn!("resuming anyway; ids that no longer exist are ignored");
    }

    let defined = graph.defined_ids();
    let mut to_run = match &args.resume_from {
        Some(id) => {
            let plan = checkpoint.get_resume_from_task(&TaskId::new(id.as_str()), &defined)?;
            let to_run: BTreeSet<TaskId> = plan.to_run.into_iter().collect();
            checkpoint.prepare_resume(&to_run, &plan.to_skip)?;
            to_run
        }
        None => {
            let plan = checkpoint.get_tasks_for_resume(&graph.safe_retry_by_id());
            let to_run = plan.into_runnable(args.force_resume)?;
            checkpoint.prepare_resume(&to_run, &[])?;
            to_run
        }
    };

    // Ids added to the taskfile after the checkpoint was written always run.
    to_run.extend(
        defined
            .into_iter()
            .filter(|id| checkpoint.record(id).is_none()),
    );

    info!(
        workflow = %checkpoint.workflow_id,
        to_run = to_run.len(),
        progress = format!("{:.1}%", checkpoint.progress_percentage()),
        "resuming run"
    );
    Ok(Some(ResumeState { checkpoint, to_run }))
}

fn run_taskfile(config_path: Option<&Path>, args: RunArgs) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let taskfile = load_taskfile(&args.taskfile)?;
    let graph = taskfile.build_graph()?;
    graph.validate()?;

    let max_workers = args.workers.unwrap_or(config.max_workers);
    if max_workers == 0 {
        return Err(Error::Validation("--workers must be at least 1".into()));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_async(config, taskfile, graph, args, max_workers))
}

async fn run_async(
    config: Config,
    taskfile: Taskfile,
    mut graph: TaskGraph,
    args: RunArgs,
    max_workers: usize,
) -> Result<ExitCode> {
    info!(
        workflow = %taskfile.workflow,
        taskfile = %taskfile.path.display(),
        "starting workflow"
    );

    // Optimizer: chain edges and ready-queue ordering from recorded durations.
    let history = if config.optimizer.enabled {
        let path = config.history_path()?;
        Some(Arc::new(
            procflow::util::blocking(move || InMemoryDurationHistory::load(&path)).await?,
        ))
    } else {
        None
    };
    let optimizer = history
        .as_ref()
        .map(|h| Arc::new(ContentionOptimizer::new(config.optimizer.clone(), h.clone())));
    if let Some(optimizer) = &optimizer {
        let plan = optimizer.apply(&mut graph);
        if plan.driver.is_some() && plan.recommended_workers != max_workers {
            info!(
                recommended = plan.recommended_workers,
                configured = max_workers,
                critical_path_secs = plan.critical_path_secs,
                "worker count differs from the contention estimate"
            );
        }
    }

    let resume = prepare_resume(&config, &taskfile, &graph, &args)?;

    // Exclusivity: announce first so runs arriving while we wait can see us.
    let exclusive = args.exclusive || config.exclusivity.exclusive;
    let registry = Arc::new(
        DirectorySessionRegistry::new(config.registry_dir()?)
            .with_max_label_len(config.exclusivity.max_label_len)
            .with_stale_after(config.exclusivity.stale_after()),
    );
    let coordinator = Arc::new(ExclusivityCoordinator::new(
        registry,
        graph.targets(),
        &taskfile.workflow,
    ));
    let heartbeat = tokio::spawn(refresh_sessions(
        coordinator.clone(),
        config.exclusivity.heartbeat_interval(),
    ));

    let prepared = PreparedRun {
        graph,
        resume,
        optimizer,
        exclusive,
        max_workers,
    };
    let outcome = run_with_access(&config, &taskfile, &args, prepared, &coordinator).await;
    heartbeat.abort();
    if let Err(e) = coordinator.release().await {
        warn!(error = %e, "failed to release session labels");
    }
    let (summary, graph, checkpoint_kept) = outcome?;

    if let Some(history) = history {
        for outcome in summary.outcomes.iter().filter(|o| o.success && o.attempts > 0) {
            if let Some(task) = graph.task(outcome.instance) {
                history.record_task(task, outcome.duration);
            }
        }
        let path = config.history_path()?;
        let save = move || history.save(&path);
        if let Err(e) = procflow::util::blocking_with_timeout(HISTORY_SAVE_TIMEOUT, save).await {
            warn!(error = %e, "failed to save duration history");
        }
    }

    print_summary(&taskfile, &summary, checkpoint_kept.as_deref());
    Ok(if summary.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Keep this run's registry entries fresh until aborted.
async fn refresh_sessions(coordinator: Arc<ExclusivityCoordinator>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = coordinator.refresh().await {
            warn!(error = %e, "failed to refresh session labels");
        }
    }
}

/// Everything decided before the run asks for access.
struct PreparedRun {
    graph: TaskGraph,
    resume: Option<ResumeState>,
    optimizer: Option<Arc<ContentionOptimizer>>,
    exclusive: bool,
    max_workers: usize,
}

/// Announce, wait for access, then run the scheduler.
///
/// The checkpoint is only written once access is granted, so a run that
/// times out waiting leaves an earlier checkpoint untouched.
async fn run_with_access(
    config: &Config,
    taskfile: &Taskfile,
    args: &RunArgs,
    prepared: PreparedRun,
    coordinator: &ExclusivityCoordinator,
) -> Result<(RunSummary, TaskGraph, Option<PathBuf>)> {
    let PreparedRun {
        graph,
        resume,
        optimizer,
        exclusive,
        max_workers,
    } = prepared;
    coordinator.announce(exclusive).await?;
    coordinator
        .wait_for_access(
            exclusive,
            config.exclusivity.timeout(),
            config.exclusivity.poll_interval(),
            args.force_exclusive || config.exclusivity.force,
        )
        .await?;

    // Checkpoint: fresh, or aligned with an earlier run.
    let checkpoint_dir = config.checkpoint_dir()?;
    let manager = match &resume {
        Some(state) => CheckpointManager::with_persistence(
            &checkpoint_dir,
            state.checkpoint.clone(),
            Box::new(FileCheckpointPersistence),
            config.checkpoint.interval(),
            config.checkpoint.enabled,
        )?,
        None => {
            let existing = checkpoint_path(&checkpoint_dir, &taskfile.workflow);
            if config.checkpoint.enabled && existing.exists() {
                warn!(
                    path = %existing.display(),
                    "replacing checkpoint of an earlier run; pass --resume to continue it instead"
                );
            }
            CheckpointManager::new(
                &checkpoint_dir,
                &taskfile.path,
                &taskfile.workflow,
                &graph.defined_ids(),
                config.checkpoint.interval(),
                config.checkpoint.enabled,
            )?
        }
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, letting running tasks finish");
            signal_token.cancel();
        }
    });

    let (event_tx, event_rx) = mpsc::channel(256);
    let printer = tokio::spawn(print_events(event_rx));

    let runner = match taskfile.path.parent() {
        Some(dir) => ShellRunner::new().with_working_dir(dir),
        None => ShellRunner::new(),
    };
    let mut scheduler = Scheduler::new(graph, Arc::new(RetryingExecutor::new(runner)), max_workers)
        .with_events(event_tx)
        .with_cancellation(cancel);
    if let Some(optimizer) = optimizer {
        scheduler = scheduler.with_optimizer(optimizer);
    }
    if let Some(state) = &resume {
        scheduler.resume_from_checkpoint(&state.checkpoint, &state.to_run)?;
    }
    let mut scheduler = scheduler.with_checkpoint(manager);

    let outcome = scheduler.run().await;
    signal.abort();
    let summary = outcome?;

    let checkpoint_kept = scheduler
        .checkpoint()
        .filter(|m| m.is_enabled() && m.path().exists())
        .map(|m| m.path().to_path_buf());
    let graph = scheduler.into_graph();
    // The scheduler owned the only sender; the printer ends with it.
    let _ = printer.await;
    Ok((summary, graph, checkpoint_kept))
}

async fn print_events(mut events: mpsc::Receiver<SchedulerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::TaskStarted { task_id, instance } => {
                println!("  start  {} {}", task_id, instance);
            }
            SchedulerEvent::TaskCompleted {
                task_id,
                instance,
                duration,
            } => {
                println!(
                    "  done   {} {} ({:.1}s)",
                    task_id,
                    instance,
                    duration.as_secs_f64()
                );
            }
            SchedulerEvent::TaskFailed {
                task_id,
                instance,
                reason,
            } => {
                println!("  FAIL   {} {}: {}", task_id, instance, reason);
            }
            SchedulerEvent::AllTasksComplete => {}
        }
    }
}

fn print_summary(taskfile: &Taskfile, summary: &RunSummary, checkpoint: Option<&Path>) {
    println!();
    println!("Workflow:  {}", taskfile.workflow);
    println!("Executed:  {}", summary.executed());
    println!("Failed:    {}", summary.failed());
    let status = if summary.is_success() {
        "succeeded"
    } else if summary.cancelled {
        "interrupted"
    } else {
        "failed"
    };
    println!("Status:    {}", status);
    if let Some(path) = checkpoint {
        println!("Checkpoint: {}", path.display());
        println!(
            "Resume with: procflow run --resume {}",
            taskfile.path.display()
        );
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let taskfile = load_taskfile(path)?;
    let graph = taskfile.build_graph()?;
    graph.validate()?;

    let undefined: Vec<TaskId> = graph
        .task_ids()
        .into_iter()
        .filter(|id| graph.instances_of(id).is_empty())
        .collect();

    println!("Taskfile:      {}", taskfile.path.display());
    println!("Workflow:      {}", taskfile.workflow);
    println!("Tasks:         {}", graph.defined_ids().len());
    println!("Instances:     {}", graph.instance_count());
    println!("Dependencies:  {}", graph.dependency_count());
    println!("Targets:       {}", graph.targets().join(", "));
    if !undefined.is_empty() {
        let names: Vec<&str> = undefined.iter().map(TaskId::as_str).collect();
        println!("Undefined predecessors: {}", names.join(", "));
        return Err(Error::Validation(format!(
            "{} predecessor(s) referenced but never defined",
            undefined.len()
        )));
    }
    println!("OK");
    Ok(())
}

fn run_status(config_path: Option<&Path>, path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let taskfile = load_taskfile(path)?;
    let Some(checkpoint) = locate_checkpoint(&config.checkpoint_dir()?, &taskfile)? else {
        println!("No checkpoint for {}", taskfile.path.display());
        return Ok(());
    };

    println!("Workflow:     {}", checkpoint.workflow_id);
    println!(
        "Updated:      {}",
        checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "Progress:     {:.1}% ({}/{})",
        checkpoint.progress_percentage(),
        checkpoint.completed_count(),
        checkpoint.total_tasks
    );
    print_ids("Failed", &checkpoint.failed_tasks());
    print_ids("In progress", &checkpoint.in_progress_tasks());
    print_ids("Pending", &checkpoint.pending_tasks());
    print_ids("Skipped", &checkpoint.skipped_tasks());

    if checkpoint.validate_against_taskfile(&taskfile.path, false)? == FingerprintCheck::Mismatch {
        println!("Note: the taskfile changed since this checkpoint was written");
    }
    Ok(())
}

fn print_ids(label: &str, ids: &BTreeSet<TaskId>) {
    if ids.is_empty() {
        return;
    }
    let names: Vec<&str> = ids.iter().map(TaskId::as_str).collect();
    println!("{:<13} {}", format!("{}:", label), names.join(", "));
}
