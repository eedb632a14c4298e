//! Dynamic planner for reshaping the backlog while the factory runs.
//!
//! On a fixed wall-clock interval the planner shows an agent the current
//! progress and the tasks still waiting, and asks for a [`PlanDirective`]:
//! tasks to add, priorities to change, tasks to retire. Applying a directive
//! yields a [`TaskDiff`]. Tasks that are running or validating are never
//! touched, and planner calls never occupy a worker slot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{Backlog, Priority, ProgressSnapshot, Task, TaskId, TaskStatus, Tier};
use crate::error::{Error, Result};
use crate::orchestration::judges::decode::extract_json;
use crate::orchestration::provider::{Invocation, Provider};
use crate::orchestration::router::ComplexityRouter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reprioritization {
    pub id: TaskId,
    pub priority: Priority,
}

/// What the planning agent asked for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanDirective {
    pub add: Vec<Task>,
    pub reprioritize: Vec<Reprioritization>,
    pub retire: Vec<TaskId>,
}

impl PlanDirective {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.reprioritize.is_empty() && self.retire.is_empty()
    }
}

/// Changes actually applied to the backlog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDiff {
    pub added: Vec<TaskId>,
    pub reprioritized: Vec<(TaskId, Priority)>,
    pub retired: Vec<TaskId>,
    /// Directive entries that were ignored, with the reason.
    pub rejected: Vec<(String, String)>,
}

impl TaskDiff {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.reprioritized.is_empty() || !self.retired.is_empty()
    }

    pub fn change_count(&self) -> usize {
        self.added.len() + self.reprioritized.len() + self.retired.len()
    }
}

/// Apply a directive to the backlog.
///
/// New tasks are routed before insertion, so they are never eligible
/// without a tier. Reprioritizing and retiring only touch tasks that are
/// waiting to be dispatched.
pub fn apply_directive(
    backlog: &mut Backlog,
    directive: PlanDirective,
    router: &ComplexityRouter,
) -> TaskDiff {
    let mut diff = TaskDiff::default();

    for mut task in directive.add {
        task.status = TaskStatus::Pending;
        task.attempt_count = 0;
        task.last_error = None;
        task.started_at = None;
        task.completed_at = None;
        match router.route(&task) {
            Ok(tier) => task.assigned_tier = Some(tier),
            Err(e) => {
                diff.rejected.push((task.id.to_string(), e.to_string()));
                continue;
            }
        }
        let id = task.id.clone();
        match backlog.add(task) {
            Ok(()) => diff.added.push(id),
            Err(e) => diff.rejected.push((id.to_string(), e.to_string())),
        }
    }

    for change in directive.reprioritize {
        if backlog.reprioritize(&change.id, change.priority) {
            diff.reprioritized.push((change.id, change.priority));
        } else {
            diff.rejected.push((
                change.id.to_string(),
                "not waiting for dispatch".to_string(),
            ));
        }
    }

    for id in directive.retire {
        let waiting = backlog
            .get(&id)
            .map(|t| t.status.is_dispatchable())
            .unwrap_or(false);
        if waiting && backlog.retire(&id).is_some() {
            diff.retired.push(id);
        } else {
            diff.rejected.push((id.to_string(), "not waiting for dispatch".to_string()));
        }
    }

    if !diff.rejected.is_empty() {
        debug!(rejected = ?diff.rejected, "planner entries ignored");
    }
    diff
}

pub fn build_prompt(snapshot: &ProgressSnapshot, waiting: &[Task]) -> String {
    let queue = if waiting.is_empty() {
        "(empty)".to_string()
    } else {
        waiting
            .iter()
            .map(|t| {
                format!(
                    "- id: {} | priority: {} | status: {} | attempts: {} | {}",
                    t.id, t.priority, t.status, t.attempt_count, t.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"You are the planner for an autonomous coding factory.

## Progress
total: {total}, completed: {completed}, failed: {failed}, running: {running}, waiting: {waiting_count}

## Waiting Tasks
{queue}

Decide whether the backlog should change. You may add follow-up tasks,
change priorities of waiting tasks, or retire waiting tasks that are no longer
needed. Respond with a single JSON object and nothing else:

```json
{{
  "add": [{{"id": "new-id", "description": "...", "priority": "medium", "acceptanceCriteria": []}}],
  "reprioritize": [{{"id": "existing-id", "priority": "high"}}],
  "retire": ["existing-id"]
}}
```

Use empty lists when nothing should change.
"#,
        total = snapshot.total,
        completed = snapshot.completed,
        failed = snapshot.failed,
        running = snapshot.in_flight(),
        waiting_count = snapshot.dispatchable(),
    )
}

pub fn decode_directive(output: &str) -> Result<PlanDirective> {
    let json = extract_json(output)
        .ok_or_else(|| Error::Validation("planner response has no JSON object".to_string()))?;
    Ok(serde_json::from_str(json)?)
}

pub struct DynamicPlanner {
    provider: Arc<dyn Provider>,
    tier: Tier,
    interval: Duration,
    timeout: Duration,
    working_dir: PathBuf,
    cancel: CancellationToken,
}

impl DynamicPlanner {
    pub fn new(
        provider: Arc<dyn Provider>,
        tier: Tier,
        interval: Duration,
        timeout: Duration,
        working_dir: &Path,
    ) -> Self {
        Self {
            provider,
            tier,
            interval,
            timeout,
            working_dir: working_dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Timer for planning rounds. The first tick fires one interval from now
    /// and missed ticks are skipped.
    pub fn ticker(&self) -> Interval {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Ask the agent for a directive.
    pub async fn plan(&self, snapshot: ProgressSnapshot, waiting: Vec<Task>) -> Result<PlanDirective> {
        let prompt = build_prompt(&snapshot, &waiting);
        let invocation = Invocation::new(self.tier, prompt, &self.working_dir, self.timeout)
            .with_cancel(self.cancel.clone());
        let output = self.provider.invoke(invocation).await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "planner call failed");
            return Err(Error::Validation(format!(
                "planner {}",
                output.failure_message()
            )));
        }
        let directive = decode_directive(&output.stdout)?;
        info!(
            add = directive.add.len(),
            reprioritize = directive.reprioritize.len(),
            retire = directive.retire.len(),
            "planner directive received"
        );
        Ok(directive)
    }
}
