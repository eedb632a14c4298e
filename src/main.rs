use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use foreman::config::Config;
use foreman::core::{Backlog, Tier};
use foreman::git::GitOps;
use foreman::notify::ConsoleSink;
use foreman::orchestration::{CommandProvider, Factory, FactoryEvent, FactoryReport, Provider};
use foreman::session::{AbortOutcome, Session, SessionLock, SessionStore};
use foreman::{Error, Result};

/// Foreman - autonomous backlog orchestrator for AI coding agents
#[derive(Parser, Debug)]
#[command(name = "foreman")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FOREMAN_DEBUG=1     Enable debug logging (alternative to --debug)\n    FOREMAN_LOG=<filter> Full tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.foreman/foreman.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.foreman/foreman.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the factory over a backlog
    Factory(FactoryArgs),

    /// Resume a crashed or interrupted session
    Resume {
        /// Session id or unique prefix
        id: String,
    },

    /// Abort a session, reclaiming its worktrees
    Abort {
        /// Session id or unique prefix
        id: String,
    },

    /// List sessions
    Sessions {
        /// Delete finished sessions older than the retention window
        #[arg(long)]
        cleanup: bool,

        /// Retention window in days (defaults to the config value)
        #[arg(long)]
        retention_days: Option<u64>,
    },

    /// Show progress of a session (latest if not specified)
    Status {
        /// Session id or unique prefix
        id: Option<String>,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct FactoryArgs {
    /// Backlog file (JSON array of tasks or {"tasks": [...]})
    #[arg(long, default_value = "backlog.json")]
    pub backlog: PathBuf,

    /// Repository to work in (defaults to the current directory)
    #[arg(long)]
    pub repo: Option<PathBuf>,

    #[arg(long)]
    pub fast_workers: Option<usize>,

    #[arg(long)]
    pub balanced_workers: Option<usize>,

    #[arg(long)]
    pub powerful_workers: Option<usize>,

    /// Seconds between planner rounds; 0 disables the planner
    #[arg(long)]
    pub planner_interval: Option<u64>,

    /// Tier used for planner calls
    #[arg(long)]
    pub planner_model: Option<Tier>,

    /// Dispatches per task before it is marked failed
    #[arg(long)]
    pub retry_limit: Option<u32>,

    #[arg(long, conflicts_with = "no_escalate")]
    pub escalate_on_retry: bool,

    /// Retry failed tasks at the same tier
    #[arg(long)]
    pub no_escalate: bool,

    /// Route every task to the default tier
    #[arg(long)]
    pub no_auto_route: bool,

    /// Keep worktrees after attempts finish
    #[arg(long)]
    pub no_cleanup: bool,
}

impl FactoryArgs {
    /// Fold command-line overrides into the loaded config.
    pub fn apply(&self, config: &mut Config) {
        for (tier, value) in [
            (Tier::Fast, self.fast_workers),
            (Tier::Balanced, self.balanced_workers),
            (Tier::Powerful, self.powerful_workers),
        ] {
            if let Some(value) = value {
                config.workers.set(tier, value);
            }
        }
        match self.planner_interval {
            Some(0) => config.planner.enabled = false,
            Some(secs) => {
                config.planner.enabled = true;
                config.planner.interval_secs = secs;
            }
            None => {}
        }
        if let Some(tier) = self.planner_model {
            config.planner.model = tier;
        }
        if let Some(limit) = self.retry_limit {
            config.retry_limit = limit;
        }
        if self.escalate_on_retry {
            config.escalate_on_retry = true;
        }
        if self.no_escalate {
            config.escalate_on_retry = false;
        }
        if self.no_auto_route {
            config.auto_route = false;
        }
        if self.no_cleanup {
            config.cleanup_worktrees = false;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = foreman::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Factory(args) => run_factory(config, args),
        Command::Resume { id } => run_resume(config, &id),
        Command::Abort { id } => run_abort(&id),
        Command::Sessions {
            cleanup,
            retention_days,
        } => run_sessions(&config, cleanup, retention_days),
        Command::Status { id } => run_status(id.as_deref()),
    }
}

fn provider_for(config: &Config) -> Result<Arc<dyn Provider>> {
    let provider = CommandProvider::new(config.provider.clone(), config.abort_grace())?;
    tracing::info!(binary = %provider.binary().display(), "provider located");
    Ok(Arc::new(provider))
}

fn run_factory(mut config: Config, args: FactoryArgs) -> Result<()> {
    args.apply(&mut config);
    config.validate()?;
    config.ensure_dirs()?;

    let repo = match &args.repo {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let repo = repo.canonicalize()?;
    // Worktrees branch from HEAD, so an unborn repository cannot be used.
    let head = GitOps::new(&repo)?.head_commit().map_err(|_| {
        Error::Validation(format!("{} has no commits yet", repo.display()))
    })?;
    tracing::debug!(repo = %repo.display(), head = %head, "repository checked");

    let backlog_path = args.backlog.canonicalize()?;
    let backlog = Backlog::load_json(&backlog_path)?;
    if backlog.is_empty() {
        return Err(Error::Validation(format!(
            "backlog {} has no tasks",
            backlog_path.display()
        )));
    }
    let provider = provider_for(&config)?;

    let store = SessionStore::open_default()?;
    for id in store.recover_crashed()? {
        println!("Session {} was left running and is now marked crashed (foreman resume {})", id.short(), id.short());
    }

    let mut session = Session::new(&repo, &config.worktrees_dir()?, backlog.tasks().to_vec())
        .with_backlog_path(&backlog_path);
    let lock = store.start(&mut session)?;
    println!(
        "Session {} started: {} task(s) from {}",
        session.id.short(),
        backlog.len(),
        backlog_path.display()
    );
    run_session(&config, provider, store, session, lock)
}

fn run_resume(config: Config, id: &str) -> Result<()> {
    config.validate()?;
    let store = SessionStore::open_default()?;
    let id = store.find(id)?.id;
    let provider = provider_for(&config)?;
    let resumed = store.resume(id)?;
    println!(
        "Session {} resumed: {} task(s) requeued, {} worktree(s) reclaimed",
        id.short(),
        resumed.requeued.len(),
        resumed.cleanup.removed.len()
    );
    run_session(&config, provider, store, resumed.session, resumed.lock)
}

fn run_session(
    config: &Config,
    provider: Arc<dyn Provider>,
    store: SessionStore,
    session: Session,
    lock: SessionLock,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = Factory::new(config, provider, store, session, lock)?
            .with_events(tx)
            .with_sink(Arc::new(ConsoleSink));

        let cancel = factory.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                println!("Interrupted, aborting (in-flight tasks will be requeued)...");
                cancel.cancel();
            }
        });
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        let report = factory.run().await?;
        let _ = printer.await;
        print_report(&report);
        Ok::<(), Error>(())
    })
}

fn print_event(event: &FactoryEvent) {
    match event {
        FactoryEvent::TaskDispatched {
            task_id,
            tier,
            attempt,
        } => println!("→ {} dispatched to {} (attempt {})", task_id, tier, attempt),
        FactoryEvent::TaskValidating { task_id } => println!("… {} validating", task_id),
        FactoryEvent::TaskCompleted {
            task_id, attempts, ..
        } => println!("✓ {} accepted after {} attempt(s)", task_id, attempts),
        FactoryEvent::TaskRetrying {
            task_id,
            decision,
            reason,
        } => println!("↻ {} {}: {}", task_id, decision, reason),
        FactoryEvent::TaskFailed { task_id, .. } => println!("✗ {} failed", task_id),
        FactoryEvent::TaskUnroutable { task_id, reason } => {
            println!("! {} cannot be routed: {}", task_id, reason)
        }
        FactoryEvent::PlanApplied {
            added,
            reprioritized,
            retired,
        } => println!(
            "Planner: {} added, {} reprioritized, {} retired",
            added, reprioritized, retired
        ),
        FactoryEvent::Aborted { requeued } => {
            println!("Run aborted, {} task(s) requeued", requeued.len())
        }
        FactoryEvent::AllTasksComplete => println!("No routable work left"),
    }
}

fn print_report(report: &FactoryReport) {
    println!();
    println!("Session {}: {}", &report.session_id[..8.min(report.session_id.len())], report.progress);
    for task in &report.tasks {
        let tier = task.final_tier.map(|t| t.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} {:<12} tier={:<9} attempts={}",
            task.task_id.to_string(),
            task.status.to_string(),
            tier,
            task.attempts
        );
    }
    if report.aborted {
        println!("Resume with: foreman resume {}", &report.session_id[..8.min(report.session_id.len())]);
    }
}

fn run_abort(id: &str) -> Result<()> {
    let store = SessionStore::open_default()?;
    let id = store.find(id)?.id;
    match store.abort(id)? {
        AbortOutcome::Signalled => {
            println!("Session {} is running; it has been asked to abort", id.short())
        }
        AbortOutcome::Aborted { requeued, cleanup } => {
            println!(
                "Session {} aborted: {} task(s) requeued, {} worktree(s) removed ({} orphaned)",
                id.short(),
                requeued.len(),
                cleanup.removed.len(),
                cleanup.orphaned.len()
            );
            for (path, error) in &cleanup.failed {
                println!("  could not remove {}: {}", path.display(), error);
            }
        }
    }
    Ok(())
}

fn retention_window(days: u64) -> Result<Duration> {
    days.checked_mul(24 * 60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::Validation(format!("retention of {} days is out of range", days)))
}

fn run_sessions(config: &Config, cleanup: bool, retention_days: Option<u64>) -> Result<()> {
    let store = SessionStore::open_default()?;
    store.recover_crashed()?;
    if cleanup {
        let days = retention_days.unwrap_or(config.session_retention_days);
        let removed = store.cleanup(retention_window(days)?)?;
        println!("Removed {} session(s) older than {} day(s)", removed.len(), days);
    }

    let sessions = store.list()?;
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    println!("{:<10} {:<10} {:<20} PROGRESS", "ID", "STATUS", "STARTED");
    for session in sessions {
        let progress = session.progress();
        println!(
            "{:<10} {:<10} {:<20} {}/{} completed, {} failed",
            session.id.short(),
            session.status.to_string(),
            session.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            progress.completed,
            progress.total,
            progress.failed
        );
    }
    Ok(())
}

fn run_status(id: Option<&str>) -> Result<()> {
    let store = SessionStore::open_default()?;
    let session = match id {
        Some(id) => store.find(id)?,
        None => match store.latest()? {
            Some(session) => session,
            None => {
                println!("No sessions");
                return Ok(());
            }
        },
    };

    println!("Session {} ({})", session.id, session.status);
    println!("  repo:    {}", session.repo_path.display());
    println!("  updated: {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  {}", session.progress());
    if !session.active_tasks.is_empty() {
        println!("  running:");
        for (task_id, worker) in &session.active_tasks {
            println!(
                "    {} on {} (attempt {}) in {}",
                task_id,
                worker.tier,
                worker.attempt,
                worker.worktree.display()
            );
        }
    }
    for task in &session.tasks {
        if let Some(error) = &task.last_error {
            println!("  {} [{}]: {}", task.id, task.status, error);
        }
    }
    Ok(())
}
