//! Task data model for the backlog.
//!
//! Tasks are the atomic units of work handed to worker agents. Each task
//! tracks its status, priority, routing tier, attempt count and the judges
//! that gate its acceptance. Only the orchestrator mutates tasks; workers
//! produce a diff and a summary that the orchestrator interprets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a task, taken from the backlog entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form used for worktree and branch names.
    pub fn slug(&self) -> String {
        let slug: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let trimmed = slug.trim_matches('-');
        if trimmed.is_empty() {
            "task".to_string()
        } else {
            trimmed.to_string()
        }
    }

    /// Worktree and branch key: the slug plus a digest of the raw id.
    ///
    /// `slug` folds case and punctuation, so `T-1` and `t-1` share a slug.
    /// The digest keeps their keys apart.
    pub fn workspace_key(&self) -> String {
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes()).simple().to_string();
        format!("{}-{}", self.slug(), &digest[..8])
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task priority. Ordering follows urgency: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Execution tier, ordered by capability and cost.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    #[default]
    Balanced,
    Powerful,
}

impl Tier {
    /// All tiers, cheapest first.
    pub const ALL: [Tier; 3] = [Tier::Fast, Tier::Balanced, Tier::Powerful];

    /// The next more capable tier. Saturates at `Powerful`.
    pub fn escalate(self) -> Tier {
        match self {
            Tier::Fast => Tier::Balanced,
            Tier::Balanced | Tier::Powerful => Tier::Powerful,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Tier::Fast => 0,
            Tier::Balanced => 1,
            Tier::Powerful => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Powerful => "powerful",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" | "cheap" => Ok(Tier::Fast),
            "balanced" | "standard" => Ok(Tier::Balanced),
            "powerful" | "expensive" => Ok(Tier::Powerful),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be dispatched.
    #[default]
    Pending,
    /// A worker is running an attempt.
    InProgress,
    /// The attempt finished and gates/judges are evaluating it.
    Validating,
    /// Accepted.
    Completed,
    /// Retry budget exhausted.
    Failed,
    /// Waiting to be retried at a higher tier.
    Escalated,
}

impl TaskStatus {
    /// Whether the scheduler may pick this task up.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Escalated)
    }

    /// Whether an attempt currently owns this task.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Validating)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Validating => write!(f, "validating"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Escalated => write!(f, "escalated"),
        }
    }
}

fn default_required() -> bool {
    true
}

/// Configuration of one judge on a task's panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeConfig {
    /// Persona label, e.g. "Security Auditor".
    pub persona: String,
    /// Required judges block acceptance when they fail. Defaults to true.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Tier used for the judge's own provider call.
    #[serde(default)]
    pub model: Tier,
    /// Criteria overriding the persona defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Vec<String>>,
    /// Whether the judge expects visual evidence of the change.
    #[serde(default)]
    pub require_evidence: bool,
}

impl JudgeConfig {
    pub fn new(persona: &str) -> Self {
        Self {
            persona: persona.to_string(),
            required: true,
            model: Tier::default(),
            criteria: None,
            require_evidence: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_model(mut self, model: Tier) -> Self {
        self.model = model;
        self
    }

    pub fn requiring_evidence(mut self) -> Self {
        self.require_evidence = true;
        self
    }
}

/// A single backlog item. Serialized with camelCase keys to match backlog files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub judges: Vec<JudgeConfig>,
    #[serde(default)]
    pub attempt_count: u32,
    /// Tier chosen by the router (or raised by escalation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_tier: Option<Tier>,
    /// Explicit route from the backlog entry; always wins over the heuristic.
    #[serde(default, rename = "tier", skip_serializing_if = "Option::is_none")]
    pub tier_override: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with medium priority and no judges.
    pub fn new(id: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(id),
            description: description.to_string(),
            priority: Priority::default(),
            category: String::new(),
            status: TaskStatus::Pending,
            acceptance_criteria: Vec::new(),
            judges: Vec::new(),
            attempt_count: 0,
            assigned_tier: None,
            tier_override: None,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.acceptance_criteria = criteria.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_judges(mut self, judges: Vec<JudgeConfig>) -> Self {
        self.judges = judges;
        self
    }

    pub fn with_tier_override(mut self, tier: Tier) -> Self {
        self.tier_override = Some(tier);
        self
    }

    /// Record a dispatch: bumps the attempt count and marks the task running.
    pub fn start_attempt(&mut self) {
        self.attempt_count += 1;
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_validating(&mut self) {
        self.status = TaskStatus::Validating;
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.last_error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }

    /// Put the task back in the queue after a failed attempt.
    pub fn requeue(&mut self, error: &str) {
        self.status = TaskStatus::Pending;
        self.last_error = Some(error.to_string());
    }

    /// Queue the task for a retry at `tier`. Never lowers the tier.
    pub fn escalate_to(&mut self, tier: Tier, error: &str) {
        let current = self.assigned_tier.unwrap_or(tier);
        self.assigned_tier = Some(current.max(tier));
        self.status = TaskStatus::Escalated;
        self.last_error = Some(error.to_string());
    }

    /// Return an interrupted task to the queue without touching its error.
    pub fn reset_interrupted(&mut self) {
        if self.status.is_in_flight() {
            self.status = TaskStatus::Pending;
            self.started_at = None;
        }
    }
}
