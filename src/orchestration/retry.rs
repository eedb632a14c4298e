//! Retry and escalation decisions for finished attempts.
//!
//! Every attempt ends in exactly one [`Decision`]. The retry budget counts
//! dispatches: a task with `retry_limit = 3` runs at most three times. When
//! escalation is enabled each retry moves one tier up, and a task's tier
//! never goes back down.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId, Tier};

/// Why an attempt did not produce an accepted result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttemptFailure {
    /// The worktree could not be created.
    Provisioning { message: String },
    /// The agent exited non-zero or could not be started.
    Execution { message: String },
    /// The agent ran past its timeout and was killed.
    Timeout { secs: u64 },
    /// A validation gate failed; judges were not consulted.
    Gate { gate: String, detail: String },
    /// One or more required judges rejected the change.
    Judges { failed: Vec<String>, summary: String },
}

impl AttemptFailure {
    pub fn describe(&self) -> String {
        match self {
            AttemptFailure::Provisioning { message } => format!("provisioning failed: {}", message),
            AttemptFailure::Execution { message } => format!("worker failed: {}", message),
            AttemptFailure::Timeout { secs } => format!("worker timed out after {}s", secs),
            AttemptFailure::Gate { detail, .. } => detail.clone(),
            AttemptFailure::Judges { summary, .. } => summary.clone(),
        }
    }

    /// The gate or judges responsible, for failure reports.
    pub fn culprit(&self) -> Option<String> {
        match self {
            AttemptFailure::Gate { gate, .. } => Some(format!("gate '{}'", gate)),
            AttemptFailure::Judges { failed, .. } if !failed.is_empty() => {
                Some(format!("judge(s) {}", failed.join(", ")))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Accepted,
    RetrySameTier,
    RetryEscalated { to: Tier },
    Exhausted,
}

impl Decision {
    pub fn is_terminal(self) -> bool {
        matches!(self, Decision::Accepted | Decision::Exhausted)
    }

    /// Move the task into the state this decision calls for.
    pub fn apply(self, task: &mut Task, failure: Option<&AttemptFailure>) {
        let error = failure.map(AttemptFailure::describe).unwrap_or_default();
        match self {
            Decision::Accepted => task.complete(),
            Decision::RetrySameTier => task.requeue(&error),
            Decision::RetryEscalated { to } => task.escalate_to(to, &error),
            Decision::Exhausted => task.fail(&error),
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Accepted => write!(f, "accepted"),
            Decision::RetrySameTier => write!(f, "retry"),
            Decision::RetryEscalated { to } => write!(f, "retry at {}", to),
            Decision::Exhausted => write!(f, "exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub escalate_on_retry: bool,
}

impl RetryPolicy {
    pub fn new(retry_limit: u32, escalate_on_retry: bool) -> Self {
        Self {
            retry_limit,
            escalate_on_retry,
        }
    }

    /// Decide what happens after an attempt.
    ///
    /// `repeated` marks a failure identical to the task's previous one; only
    /// provisioning failures are cut short by it.
    pub fn decide(&self, task: &Task, failure: Option<&AttemptFailure>, repeated: bool) -> Decision {
        let Some(failure) = failure else {
            return Decision::Accepted;
        };
        if repeated && matches!(failure, AttemptFailure::Provisioning { .. }) {
            return Decision::Exhausted;
        }
        if task.attempt_count >= self.retry_limit {
            return Decision::Exhausted;
        }
        let current = task.assigned_tier.unwrap_or_default();
        let next = current.escalate();
        if self.escalate_on_retry && next > current {
            Decision::RetryEscalated { to: next }
        } else {
            Decision::RetrySameTier
        }
    }
}

/// Remembers each task's last provisioning failure so a repeat can be spotted.
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    last_provisioning: HashMap<TaskId, String>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure. Returns true if it repeats the task's previous
    /// provisioning failure word for word.
    pub fn record(&mut self, task_id: &TaskId, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Provisioning { message } => {
                let previous = self.last_provisioning.insert(task_id.clone(), message.clone());
                previous.as_deref() == Some(message.as_str())
            }
            _ => {
                self.last_provisioning.remove(task_id);
                false
            }
        }
    }

    pub fn reset(&mut self, task_id: &TaskId) {
        self.last_provisioning.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.last_provisioning.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_provisioning.is_empty()
    }
}
