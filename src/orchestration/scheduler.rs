//! The factory: the loop that drives the backlog to completion.
//!
//! The factory routes pending tasks, claims a task whenever a slot of its
//! tier is free, and runs each attempt as a future in a `JoinSet`. Every
//! attempt goes through the same steps: provision a worktree, run the
//! worker, collect the diff, run the gates, then the judges. When the
//! attempt finishes, the retry policy decides what happens to the task and
//! the session is checkpointed.
//!
//! The loop only blocks when nothing can be dispatched. It wakes on attempt
//! completion, attempt status updates, planner ticks and results, the abort
//! marker poll, and cancellation.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::{Backlog, JudgeConfig, ProgressSnapshot, Task, TaskId, TaskStatus, Tier};
use crate::error::{Error, Result};
use crate::notify::{LogSink, NotificationSink};
use crate::orchestration::gates::GateRunner;
use crate::orchestration::judges::{
    format_console, format_discord, AggregatedJudgeResult, JudgeContext, JudgePanel,
};
use crate::orchestration::planner::{apply_directive, DynamicPlanner, PlanDirective};
use crate::orchestration::pool::{SlotHandle, SlotPool};
use crate::orchestration::provider::{Invocation, Provider};
use crate::orchestration::retry::{AttemptFailure, Decision, FailureTracker, RetryPolicy};
use crate::orchestration::router::ComplexityRouter;
use crate::orchestration::workspace::{Workspace, WorkspaceManager};
use crate::session::{Session, SessionLock, SessionStatus, SessionStore, WorkerHandle};
use crate::util::blocking;

const DEFAULT_ABORT_POLL: Duration = Duration::from_secs(1);

/// Lifecycle events, for anything that wants to follow a run.
#[derive(Debug, Clone, PartialEq)]
pub enum FactoryEvent {
    TaskDispatched {
        task_id: TaskId,
        tier: Tier,
        attempt: u32,
    },
    TaskValidating {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        attempts: u32,
        commit: Option<String>,
    },
    TaskRetrying {
        task_id: TaskId,
        decision: Decision,
        reason: String,
    },
    TaskFailed {
        task_id: TaskId,
        summary: String,
    },
    TaskUnroutable {
        task_id: TaskId,
        reason: String,
    },
    PlanApplied {
        added: usize,
        reprioritized: usize,
        retired: usize,
    },
    Aborted {
        requeued: Vec<TaskId>,
    },
    AllTasksComplete,
}

/// Final state of one task in a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    pub final_tier: Option<Tier>,
    pub decision: Option<Decision>,
    pub last_failure: Option<AttemptFailure>,
    pub commit: Option<String>,
}

impl TaskReport {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            attempts: task.attempt_count,
            final_tier: task.assigned_tier,
            decision: None,
            last_failure: None,
            commit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FactoryReport {
    pub session_id: String,
    pub tasks: Vec<TaskReport>,
    pub progress: ProgressSnapshot,
    pub aborted: bool,
}

impl FactoryReport {
    pub fn failed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Failed)
    }

    pub fn completed(&self) -> impl Iterator<Item = &TaskReport> {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Completed)
    }
}

/// One line naming the task, what failed it, and how many attempts it had.
pub fn exhaustion_summary(task_id: &TaskId, attempts: u32, failure: Option<&AttemptFailure>) -> String {
    match failure {
        Some(failure) => match failure.culprit() {
            Some(culprit) => format!(
                "Task '{}' failed after {} attempt(s): {} rejected it. {}",
                task_id,
                attempts,
                culprit,
                failure.describe()
            ),
            None => format!(
                "Task '{}' failed after {} attempt(s): {}",
                task_id,
                attempts,
                failure.describe()
            ),
        },
        None => format!("Task '{}' failed after {} attempt(s)", task_id, attempts),
    }
}

/// Prompt handed to the worker agent.
pub fn worker_prompt(task: &Task) -> String {
    let mut prompt = format!(
        "You are working on task {} in an isolated git worktree.\n\n## Task\n{}\n",
        task.id, task.description
    );
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\n## Acceptance Criteria\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    if let Some(previous) = &task.last_error {
        prompt.push_str(&format!(
            "\n## Previous Attempt\nThe previous attempt was rejected: {}\nAddress this before anything else.\n",
            previous
        ));
    }
    prompt.push_str(
        "\nMake the change directly in this directory. Do not commit. \
         Finish with a short summary of what you changed.\n",
    );
    prompt
}

#[derive(Debug)]
enum AttemptUpdate {
    Validating { task_id: TaskId, attempt: u32 },
}

#[derive(Debug)]
struct AttemptOutcome {
    failure: Option<AttemptFailure>,
    judges: Option<AggregatedJudgeResult>,
    commit: Option<String>,
}

impl AttemptOutcome {
    fn failed(failure: AttemptFailure) -> Self {
        Self {
            failure: Some(failure),
            judges: None,
            commit: None,
        }
    }
}

/// What a spawned attempt hands back to the loop.
struct Finished {
    task_id: TaskId,
    attempt: u32,
    outcome: AttemptOutcome,
}

/// Shared, read-only pieces every attempt needs.
struct AttemptContext {
    provider: Arc<dyn Provider>,
    workspaces: WorkspaceManager,
    gates: GateRunner,
    judges: JudgePanel,
    default_judges: Vec<JudgeConfig>,
    worker_timeout: Duration,
    cleanup: bool,
    cancel: CancellationToken,
    updates: mpsc::UnboundedSender<AttemptUpdate>,
}

impl AttemptContext {
    async fn run(self: Arc<Self>, task: Task, tier: Tier, slot: SlotHandle) -> AttemptOutcome {
        let _slot = slot;
        let attempt = task.attempt_count;

        let ctx = Arc::clone(&self);
        let id = task.id.clone();
        let workspace = match blocking(move || ctx.workspaces.provision(&id, attempt)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(task = %task.id, attempt, error = %e, "worktree provisioning failed");
                return AttemptOutcome::failed(AttemptFailure::Provisioning {
                    message: e.to_string(),
                });
            }
        };

        let mut outcome = self.execute(&task, tier, &workspace).await;

        if outcome.failure.is_none() {
            let ctx = Arc::clone(&self);
            let ws = workspace.clone();
            let message = format!("foreman: {} (attempt {})", task.id, attempt);
            match blocking(move || ctx.workspaces.commit(&ws, &message)).await {
                Ok(commit) => outcome.commit = commit,
                Err(e) => warn!(task = %task.id, error = %e, "failed to commit accepted attempt"),
            }
        }

        if self.cleanup {
            let keep_branch = outcome.failure.is_none();
            let ctx = Arc::clone(&self);
            let ws = workspace.clone();
            if let Err(e) = blocking(move || ctx.workspaces.teardown(&ws, keep_branch)).await {
                warn!(path = %workspace.path.display(), error = %e, "worktree teardown failed");
            }
        }
        outcome
    }

    async fn execute(&self, task: &Task, tier: Tier, workspace: &Workspace) -> AttemptOutcome {
        let invocation = Invocation::new(tier, worker_prompt(task), &workspace.path, self.worker_timeout)
            .with_cancel(self.cancel.clone());
        let output = match self.provider.invoke(invocation).await {
            Ok(out) if out.success() => out,
            Ok(out) => {
                return AttemptOutcome::failed(AttemptFailure::Execution {
                    message: out.failure_message(),
                })
            }
            Err(Error::Timeout(limit)) => {
                return AttemptOutcome::failed(AttemptFailure::Timeout {
                    secs: limit.as_secs(),
                })
            }
            Err(e) => {
                return AttemptOutcome::failed(AttemptFailure::Execution {
                    message: e.to_string(),
                })
            }
        };

        let ws = workspace.clone();
        let diff = match blocking(move || WorkspaceManager::collect_diff(&ws)).await {
            Ok(diff) => diff,
            Err(e) => {
                return AttemptOutcome::failed(AttemptFailure::Execution {
                    message: format!("could not read the worktree diff: {}", e),
                })
            }
        };
        debug!(task = %task.id, diff_len = diff.len(), "worker finished");
        let _ = self.updates.send(AttemptUpdate::Validating {
            task_id: task.id.clone(),
            attempt: task.attempt_count,
        });

        let gates = self.gates.run(&workspace.path, &self.cancel).await;
        if let Some(failed) = gates.first_failure() {
            return AttemptOutcome::failed(AttemptFailure::Gate {
                gate: failed.name.clone(),
                detail: gates.summary(),
            });
        }

        let judges = if task.judges.is_empty() {
            &self.default_judges
        } else {
            &task.judges
        };
        let ctx = JudgeContext {
            task_description: task.description.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            diff,
            worker_summary: output.stdout,
            evidence_path: None,
            working_dir: workspace.path.clone(),
        };
        let verdict = self.judges.run_judges(judges, &ctx).await;
        let failure = (!verdict.passed).then(|| AttemptFailure::Judges {
            failed: verdict.failed_required(),
            summary: verdict.summary.clone(),
        });
        AttemptOutcome {
            failure,
            judges: Some(verdict),
            commit: None,
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

type PlanCall = JoinHandle<Result<PlanDirective>>;

async fn next_plan(call: &mut Option<PlanCall>) -> Result<PlanDirective> {
    match call {
        Some(handle) => handle.await.map_err(|e| Error::TaskJoin(e.to_string()))?,
        None => std::future::pending().await,
    }
}

pub struct Factory {
    backlog: Arc<Mutex<Backlog>>,
    pool: SlotPool,
    router: ComplexityRouter,
    policy: RetryPolicy,
    failures: FailureTracker,
    planner: Option<Arc<DynamicPlanner>>,
    ctx: Arc<AttemptContext>,
    updates: Option<mpsc::UnboundedReceiver<AttemptUpdate>>,
    store: SessionStore,
    session: Session,
    lock: Option<SessionLock>,
    events: Option<mpsc::UnboundedSender<FactoryEvent>>,
    sink: Arc<dyn NotificationSink>,
    notify_cap: usize,
    abort_grace: Duration,
    abort_poll: Duration,
    cancel: CancellationToken,
    unroutable: HashSet<TaskId>,
    reports: BTreeMap<TaskId, TaskReport>,
}

impl Factory {
    /// Build a factory for a started (or resumed) session. The session's
    /// task snapshot is the backlog.
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        store: SessionStore,
        session: Session,
        lock: SessionLock,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let backlog = Backlog::from_tasks(session.tasks.clone())?;
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let ctx = AttemptContext {
            provider: Arc::clone(&provider),
            workspaces: session.workspaces()?,
            gates: GateRunner::new(config.gates.clone(), config.gate_mode, config.abort_grace()),
            judges: JudgePanel::new(Arc::clone(&provider), config.judge_mode, config.judge_timeout())
                .with_cancel(cancel.clone()),
            default_judges: config.default_judges.clone(),
            worker_timeout: config.worker_timeout(),
            cleanup: config.cleanup_worktrees,
            cancel: cancel.clone(),
            updates: updates_tx,
        };

        let planner = config.planner.enabled.then(|| {
            Arc::new(
                DynamicPlanner::new(
                    Arc::clone(&provider),
                    config.planner.model,
                    config.planner.interval(),
                    config.planner.timeout(),
                    &session.repo_path,
                )
                .with_cancel(cancel.clone()),
            )
        });

        Ok(Self {
            backlog: Arc::new(Mutex::new(backlog)),
            pool: SlotPool::new(&config.workers),
            router: ComplexityRouter::new(config.auto_route, config.default_tier)
                .with_capacity(&config.workers),
            policy: RetryPolicy::new(config.retry_limit, config.escalate_on_retry),
            failures: FailureTracker::new(),
            planner,
            ctx: Arc::new(ctx),
            updates: Some(updates_rx),
            store,
            session,
            lock: Some(lock),
            events: None,
            sink: Arc::new(LogSink),
            notify_cap: config.notify_char_limit,
            abort_grace: config.abort_grace(),
            abort_poll: DEFAULT_ABORT_POLL,
            cancel,
            unroutable: HashSet::new(),
            reports: BTreeMap::new(),
        })
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<FactoryEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_abort_poll(mut self, every: Duration) -> Self {
        self.abort_poll = every;
        self
    }

    /// Token that aborts the run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn backlog(&self) -> Arc<Mutex<Backlog>> {
        Arc::clone(&self.backlog)
    }

    fn emit(&self, event: FactoryEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn checkpoint(&mut self) -> Result<()> {
        self.session.tasks = self.backlog.lock().await.tasks().to_vec();
        self.store.checkpoint(&mut self.session).inspect_err(|e| {
            error!(session = %self.session.id, error = %e, "checkpoint failed, stopping");
        })
    }

    /// Drive the backlog until nothing routable is left or the run is
    /// aborted.
    ///
    /// # Errors
    ///
    /// Only a failed checkpoint stops the run with an error; task failures
    /// end up in the report.
    pub async fn run(mut self) -> Result<FactoryReport> {
        let mut updates = self.updates.take().ok_or_else(|| {
            Error::Validation("factory has already been run".to_string())
        })?;
        let mut attempts: JoinSet<Finished> = JoinSet::new();
        let mut planner_tick = self.planner.as_ref().map(|p| p.ticker());
        let mut planning: Option<PlanCall> = None;
        let mut abort_poll = interval(self.abort_poll.max(Duration::from_millis(10)));
        abort_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.cancel.clone();

        info!(
            session = %self.session.id,
            tasks = self.session.tasks.len(),
            planner = self.planner.is_some(),
            "factory started"
        );
        self.route_pending().await;
        self.checkpoint().await?;

        let aborted = loop {
            if cancel.is_cancelled() || self.store.abort_requested(self.session.id) {
                break true;
            }
            self.route_pending().await;
            self.dispatch(&mut attempts).await?;

            if attempts.is_empty() && !self.backlog.lock().await.has_routed_work() {
                break false;
            }

            tokio::select! {
                Some(joined) = attempts.join_next() => match joined {
                    Ok(finished) => self.finish_attempt(finished).await?,
                    Err(e) => warn!(error = %e, "attempt task ended without a result"),
                },
                Some(update) = updates.recv() => self.apply_update(update).await?,
                _ = next_tick(&mut planner_tick), if planning.is_none() => {
                    planning = self.start_planning().await;
                },
                result = next_plan(&mut planning) => {
                    planning = None;
                    self.apply_plan(result).await?;
                },
                _ = abort_poll.tick() => {},
                _ = cancel.cancelled() => {},
            }
        };

        if let Some(handle) = planning.take() {
            handle.abort();
        }
        if aborted {
            self.abort(attempts).await?;
        } else {
            self.complete().await?;
        }
        Ok(self.report(aborted).await)
    }

    /// Give every unrouted dispatchable task a tier. Tasks that cannot be
    /// routed stay pending and are reported once.
    async fn route_pending(&mut self) {
        let mut backlog = self.backlog.lock().await;
        for id in backlog.unrouted() {
            let Some(task) = backlog.get_mut(&id) else {
                continue;
            };
            match self.router.route(task) {
                Ok(tier) => {
                    task.assigned_tier = Some(tier);
                    debug!(task = %id, tier = %tier, "task routed");
                }
                Err(e) => {
                    if self.unroutable.insert(id.clone()) {
                        warn!(task = %id, error = %e, "task cannot be routed");
                        self.emit(FactoryEvent::TaskUnroutable {
                            task_id: id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        // Checkpoints from an earlier run may name a tier that has no
        // slots under the current configuration.
        let stranded: Vec<TaskId> = backlog
            .dispatchable()
            .filter(|t| t.assigned_tier.is_some_and(|tier| self.pool.capacity(tier) == 0))
            .map(|t| t.id.clone())
            .collect();
        for id in stranded {
            if let Some(task) = backlog.get_mut(&id) {
                task.assigned_tier = task.assigned_tier.map(|tier| self.router.staffed_tier(tier));
            }
        }
    }

    /// Claim and spawn work for every tier with a free slot.
    async fn dispatch(&mut self, attempts: &mut JoinSet<Finished>) -> Result<usize> {
        let mut dispatched = 0;
        for tier in Tier::ALL {
            loop {
                let claimed = {
                    let mut backlog = self.backlog.lock().await;
                    self.pool.try_acquire_with(tier, || backlog.claim_next(tier))
                };
                let Some((slot, task)) = claimed else {
                    break;
                };

                let attempt = task.attempt_count;
                let worktree: PathBuf = self.ctx.workspaces.path_for(&task.id, attempt);
                self.session.register_worker(
                    &task.id,
                    WorkerHandle {
                        tier,
                        attempt,
                        worktree,
                        started_at: Utc::now(),
                    },
                );
                self.checkpoint().await?;
                info!(task = %task.id, tier = %tier, attempt, "task dispatched");
                self.emit(FactoryEvent::TaskDispatched {
                    task_id: task.id.clone(),
                    tier,
                    attempt,
                });

                let ctx = Arc::clone(&self.ctx);
                let task_id = task.id.clone();
                attempts.spawn(async move {
                    let outcome = AssertUnwindSafe(ctx.run(task, tier, slot))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            AttemptOutcome::failed(AttemptFailure::Execution {
                                message: "attempt panicked".to_string(),
                            })
                        });
                    Finished {
                        task_id,
                        attempt,
                        outcome,
                    }
                });
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    async fn apply_update(&mut self, update: AttemptUpdate) -> Result<()> {
        let AttemptUpdate::Validating { task_id, attempt } = update;
        {
            let mut backlog = self.backlog.lock().await;
            match backlog.get_mut(&task_id) {
                Some(task) if task.status == TaskStatus::InProgress && task.attempt_count == attempt => {
                    task.mark_validating();
                }
                _ => return Ok(()),
            }
        }
        self.checkpoint().await?;
        self.emit(FactoryEvent::TaskValidating { task_id });
        Ok(())
    }

    /// Forget a finished attempt's worker. With cleanup off its worktree
    /// stays on disk and is recorded as retained.
    fn release_worker(&mut self, task_id: &TaskId) {
        if self.ctx.cleanup {
            self.session.release_worker(task_id);
        } else {
            self.session.retain_worker(task_id);
        }
    }

    async fn finish_attempt(&mut self, finished: Finished) -> Result<()> {
        let Finished {
            task_id,
            attempt,
            outcome,
        } = finished;
        let failure = outcome.failure;

        let (decision, attempts, tier) = {
            let mut backlog = self.backlog.lock().await;
            let Some(task) = backlog.get_mut(&task_id) else {
                warn!(task = %task_id, "finished attempt for a task no longer in the backlog");
                drop(backlog);
                self.release_worker(&task_id);
                return Ok(());
            };
            let repeated = match &failure {
                Some(f) => self.failures.record(&task_id, f),
                None => {
                    self.failures.reset(&task_id);
                    false
                }
            };
            let mut decision = self.policy.decide(task, failure.as_ref(), repeated);
            if let Decision::RetryEscalated { to } = decision {
                let to = self.router.staffed_tier(to);
                if task.assigned_tier.is_some_and(|current| to <= current) {
                    decision = Decision::RetrySameTier;
                } else {
                    decision = Decision::RetryEscalated { to };
                }
            }
            decision.apply(task, failure.as_ref());
            (decision, task.attempt_count, task.assigned_tier)
        };
        self.release_worker(&task_id);

        let report = self.reports.entry(task_id.clone()).or_insert_with(|| TaskReport {
            task_id: task_id.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            final_tier: None,
            decision: None,
            last_failure: None,
            commit: None,
        });
        report.attempts = attempts;
        report.final_tier = tier;
        report.decision = Some(decision);
        if failure.is_some() {
            report.last_failure = failure.clone();
        }
        if outcome.commit.is_some() {
            report.commit = outcome.commit.clone();
        }

        match decision {
            Decision::Accepted => {
                info!(task = %task_id, attempt, commit = ?outcome.commit, "task accepted");
                self.emit(FactoryEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    attempts,
                    commit: outcome.commit,
                });
            }
            Decision::RetrySameTier | Decision::RetryEscalated { .. } => {
                let reason = failure.as_ref().map(AttemptFailure::describe).unwrap_or_default();
                warn!(task = %task_id, attempt, decision = %decision, reason = %reason, "attempt rejected");
                if let Some(verdict) = &outcome.judges {
                    debug!(task = %task_id, "judge panel:\n{}", format_console(verdict));
                }
                self.emit(FactoryEvent::TaskRetrying {
                    task_id: task_id.clone(),
                    decision,
                    reason,
                });
            }
            Decision::Exhausted => {
                let summary = exhaustion_summary(&task_id, attempts, failure.as_ref());
                warn!(task = %task_id, attempts, "{}", summary);
                self.sink.notify(&summary);
                if let Some(verdict) = outcome.judges.as_ref().filter(|v| !v.passed) {
                    self.sink.notify(&format_discord(verdict, self.notify_cap));
                }
                self.emit(FactoryEvent::TaskFailed {
                    task_id: task_id.clone(),
                    summary,
                });
            }
        }

        self.checkpoint().await
    }

    async fn start_planning(&mut self) -> Option<PlanCall> {
        let planner = Arc::clone(self.planner.as_ref()?);
        let (snapshot, waiting) = {
            let backlog = self.backlog.lock().await;
            (backlog.counts(), backlog.dispatchable().cloned().collect::<Vec<_>>())
        };
        debug!(waiting = waiting.len(), "planner round started");
        Some(tokio::spawn(async move { planner.plan(snapshot, waiting).await }))
    }

    async fn apply_plan(&mut self, result: Result<PlanDirective>) -> Result<()> {
        let directive = match result {
            Ok(directive) => directive,
            Err(e) => {
                warn!(error = %e, "planner round failed");
                return Ok(());
            }
        };
        if directive.is_empty() {
            return Ok(());
        }
        let diff = {
            let mut backlog = self.backlog.lock().await;
            apply_directive(&mut backlog, directive, &self.router)
        };
        if !diff.has_changes() {
            return Ok(());
        }
        info!(
            added = diff.added.len(),
            reprioritized = diff.reprioritized.len(),
            retired = diff.retired.len(),
            "planner changes applied"
        );
        for id in &diff.retired {
            self.reports.remove(id);
        }
        self.emit(FactoryEvent::PlanApplied {
            added: diff.added.len(),
            reprioritized: diff.reprioritized.len(),
            retired: diff.retired.len(),
        });
        self.checkpoint().await
    }

    /// Stop everything: cancel, give attempts the grace period, then abort
    /// what is left, reclaim worktrees and requeue in-flight tasks.
    async fn abort(&mut self, mut attempts: JoinSet<Finished>) -> Result<()> {
        info!(session = %self.session.id, in_flight = attempts.len(), "aborting run");
        self.cancel.cancel();

        let deadline = tokio::time::sleep(self.abort_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = attempts.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = &mut deadline => {
                    warn!(remaining = attempts.len(), "grace period over, aborting attempts");
                    break;
                }
            }
        }
        attempts.abort_all();
        while attempts.join_next().await.is_some() {}

        let requeued = self.backlog.lock().await.reset_in_flight();
        let ctx = Arc::clone(&self.ctx);
        let known = self.session.worktree_paths.clone();
        let retained = self.session.retained_worktrees.clone();
        let cleanup = blocking(move || Ok(ctx.workspaces.reclaim_all(&known, &retained))).await?;
        if !cleanup.is_success() {
            warn!(failed = cleanup.failed.len(), "some worktrees could not be reclaimed");
        }
        self.session.requeue_interrupted();
        self.session.tasks = self.backlog.lock().await.tasks().to_vec();
        self.emit(FactoryEvent::Aborted {
            requeued: requeued.clone(),
        });

        match self.lock.take() {
            Some(lock) => self.store.finish(&mut self.session, SessionStatus::Aborted, lock)?,
            None => {
                self.session.status = SessionStatus::Aborted;
                self.store.checkpoint(&mut self.session)?;
            }
        }
        info!(session = %self.session.id, requeued = requeued.len(), "run aborted");
        Ok(())
    }

    async fn complete(&mut self) -> Result<()> {
        self.checkpoint().await?;
        let progress = self.backlog.lock().await.counts();
        if let Some(path) = self.session.backlog_path.clone() {
            if let Err(e) = self.backlog.lock().await.save_json(&path) {
                warn!(path = %path.display(), error = %e, "failed to write backlog statuses");
            }
        }
        self.emit(FactoryEvent::AllTasksComplete);
        if let Some(lock) = self.lock.take() {
            self.store.complete(&mut self.session, lock)?;
        }
        info!(session = %self.session.id, %progress, "factory finished");
        Ok(())
    }

    async fn report(&self, aborted: bool) -> FactoryReport {
        let backlog = self.backlog.lock().await;
        let tasks = backlog
            .tasks()
            .iter()
            .map(|task| {
                let mut report = self
                    .reports
                    .get(&task.id)
                    .cloned()
                    .unwrap_or_else(|| TaskReport::from_task(task));
                report.status = task.status;
                report.attempts = task.attempt_count;
                report.final_tier = task.assigned_tier;
                report
            })
            .collect();
        FactoryReport {
            session_id: self.session.id.to_string(),
            tasks,
            progress: backlog.counts(),
            aborted,
        }
    }
}
