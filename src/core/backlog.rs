//! The ordered task backlog.
//!
//! Insertion order is preserved and acts as the tie-breaker when two
//! dispatchable tasks share a priority.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::task::{Priority, Task, TaskId, TaskStatus, Tier};
use crate::{Error, Result};

/// Counts of tasks by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub validating: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
}

impl ProgressSnapshot {
    pub fn in_flight(&self) -> usize {
        self.in_progress + self.validating
    }

    pub fn dispatchable(&self) -> usize {
        self.pending + self.escalated
    }

    pub fn is_finished(&self) -> bool {
        self.completed + self.failed == self.total
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} failed, {} running, {} validating, {} pending, {} escalated",
            self.completed,
            self.total,
            self.failed,
            self.in_progress,
            self.validating,
            self.pending,
            self.escalated
        )
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BacklogFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

#[derive(Debug, Clone, Default)]
pub struct Backlog {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a backlog from tasks in order. Duplicate ids are rejected.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut backlog = Self::new();
        for task in tasks {
            backlog.add(task)?;
        }
        Ok(backlog)
    }

    /// Read a backlog file: either a JSON array of tasks or `{ "tasks": [...] }`.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_json(&content)
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        let tasks = match serde_json::from_str::<BacklogFile>(content)? {
            BacklogFile::List(tasks) => tasks,
            BacklogFile::Wrapped { tasks } => tasks,
        };
        Self::from_tasks(tasks)
    }

    /// Write the tasks back as a JSON array, statuses included.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.tasks)?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }

    /// Append a task. Fails if the id is already present.
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::Validation(format!("duplicate task id '{}'", task.id)));
        }
        let key = task.id.workspace_key();
        if let Some(other) = self.tasks.iter().find(|t| t.id.workspace_key() == key) {
            return Err(Error::Validation(format!(
                "task id '{}' collides with '{}' on worktree key '{}'",
                task.id, other.id, key
            )));
        }
        self.index.insert(task.id.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        match self.index.get(id) {
            Some(&i) => self.tasks.get_mut(i),
            None => None,
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Change the priority of a dispatchable task. In-flight and terminal
    /// tasks are left alone and `false` is returned.
    pub fn reprioritize(&mut self, id: &TaskId, priority: Priority) -> bool {
        match self.get_mut(id) {
            Some(task) if task.status.is_dispatchable() => {
                task.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Remove a task that is not in flight.
    pub fn retire(&mut self, id: &TaskId) -> Option<Task> {
        let pos = *self.index.get(id)?;
        if self.tasks[pos].status.is_in_flight() {
            return None;
        }
        let task = self.tasks.remove(pos);
        self.reindex();
        Some(task)
    }

    fn reindex(&mut self) {
        self.index = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
    }

    /// Dispatchable tasks that still need a tier.
    pub fn unrouted(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_dispatchable() && t.assigned_tier.is_none())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Dispatchable tasks, in backlog order.
    pub fn dispatchable(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.status.is_dispatchable())
    }

    /// Highest-priority dispatchable task routed to `tier`, first inserted
    /// on ties.
    pub fn peek_next(&self, tier: Tier) -> Option<&TaskId> {
        let mut best: Option<&Task> = None;
        for task in self
            .dispatchable()
            .filter(|t| t.assigned_tier == Some(tier))
        {
            match best {
                Some(b) if b.priority >= task.priority => {}
                _ => best = Some(task),
            }
        }
        best.map(|t| &t.id)
    }

    /// Select the next task for `tier` and start its attempt.
    pub fn claim_next(&mut self, tier: Tier) -> Option<Task> {
        let id = self.peek_next(tier)?.clone();
        let task = self.get_mut(&id)?;
        task.start_attempt();
        Some(task.clone())
    }

    /// Whether any dispatchable task has a tier and could run.
    pub fn has_routed_work(&self) -> bool {
        self.dispatchable().any(|t| t.assigned_tier.is_some())
    }

    /// Reset every in-flight task to pending. Returns the ids touched.
    pub fn reset_in_flight(&mut self) -> Vec<TaskId> {
        let mut reset = Vec::new();
        for task in &mut self.tasks {
            if task.status.is_in_flight() {
                task.reset_interrupted();
                reset.push(task.id.clone());
            }
        }
        reset
    }

    pub fn counts(&self) -> ProgressSnapshot {
        let mut snap = ProgressSnapshot {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => snap.pending += 1,
                TaskStatus::InProgress => snap.in_progress += 1,
                TaskStatus::Validating => snap.validating += 1,
                TaskStatus::Completed => snap.completed += 1,
                TaskStatus::Failed => snap.failed += 1,
                TaskStatus::Escalated => snap.escalated += 1,
            }
        }
        snap
    }
}
