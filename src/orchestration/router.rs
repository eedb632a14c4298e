//! Complexity routing: pick the cheapest tier that can plausibly do a task.

use tracing::warn;

use crate::config::WorkerCapacity;
use crate::core::{Priority, Task, Tier};
use crate::error::{Error, Result};

const COMPLEX_KEYWORDS: &[&str] = &[
    "refactor",
    "architecture",
    "architect",
    "security",
    "migrate",
    "migration",
    "concurrency",
    "concurrent",
    "race",
    "design",
    "performance",
    "distributed",
    "algorithm",
    "rewrite",
];

const TRIVIAL_KEYWORDS: &[&str] = &[
    "typo", "rename", "docs", "doc", "comment", "comments", "bump", "readme", "format", "lint",
];

const COMPLEX_CATEGORIES: &[&str] = &["architecture", "security", "infrastructure", "performance"];
const TRIVIAL_CATEGORIES: &[&str] = &["docs", "documentation", "chore", "style"];

/// Scores at or below this go to `Fast`.
pub const FAST_MAX_SCORE: i32 = 1;
/// Scores at or below this (and above `FAST_MAX_SCORE`) go to `Balanced`.
pub const BALANCED_MAX_SCORE: i32 = 4;

#[derive(Debug, Clone, Copy)]
pub struct ComplexityRouter {
    auto_route: bool,
    default_tier: Tier,
    /// Tiers that have at least one worker slot.
    staffed: [bool; 3],
}

impl ComplexityRouter {
    pub fn new(auto_route: bool, default_tier: Tier) -> Self {
        Self {
            auto_route,
            default_tier,
            staffed: [true; 3],
        }
    }

    /// Never route to a tier without worker slots.
    pub fn with_capacity(mut self, capacity: &WorkerCapacity) -> Self {
        for tier in Tier::ALL {
            self.staffed[tier.index()] = capacity.get(tier) > 0;
        }
        self
    }

    /// `tier` if it has slots, else the nearest staffed tier above it, else
    /// the nearest one below.
    pub fn staffed_tier(&self, tier: Tier) -> Tier {
        let staffed = |t: Tier| self.staffed[t.index()];
        Tier::ALL
            .into_iter()
            .filter(|t| *t >= tier)
            .find(|t| staffed(*t))
            .or_else(|| {
                Tier::ALL
                    .into_iter()
                    .rev()
                    .filter(|t| *t < tier)
                    .find(|t| staffed(*t))
            })
            .unwrap_or(tier)
    }

    /// Choose a tier for `task`. An explicit override beats the heuristic.
    ///
    /// # Errors
    ///
    /// [`Error::Routing`] when the task has no id or no description.
    pub fn route(&self, task: &Task) -> Result<Tier> {
        if task.id.as_str().trim().is_empty() {
            return Err(Error::Routing {
                task_id: String::new(),
                reason: "missing id".to_string(),
            });
        }
        if task.description.trim().is_empty() {
            return Err(Error::Routing {
                task_id: task.id.to_string(),
                reason: "missing description".to_string(),
            });
        }
        let tier = match task.tier_override {
            Some(tier) => tier,
            None if !self.auto_route => self.default_tier,
            None => tier_for_score(score(task)),
        };
        let staffed = self.staffed_tier(tier);
        if let Some(requested) = task.tier_override.filter(|t| *t != staffed) {
            warn!(
                task = %task.id,
                requested = %requested,
                routed = %staffed,
                "tier override has no workers, routing elsewhere"
            );
        }
        Ok(staffed)
    }
}

pub fn tier_for_score(score: i32) -> Tier {
    if score <= FAST_MAX_SCORE {
        Tier::Fast
    } else if score <= BALANCED_MAX_SCORE {
        Tier::Balanced
    } else {
        Tier::Powerful
    }
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Heuristic complexity score. Baseline is 1.
pub fn score(task: &Task) -> i32 {
    let mut score = 1;

    let mut text = task.description.clone();
    for criterion in &task.acceptance_criteria {
        text.push(' ');
        text.push_str(criterion);
    }
    let mut complex_hit = false;
    let mut trivial_hit = false;
    for word in words(&text) {
        if !complex_hit && COMPLEX_KEYWORDS.contains(&word.as_str()) {
            complex_hit = true;
        }
        if !trivial_hit && TRIVIAL_KEYWORDS.contains(&word.as_str()) {
            trivial_hit = true;
        }
    }
    if complex_hit {
        score += 3;
    }
    if trivial_hit {
        score -= 2;
    }

    let len = task.description.chars().count();
    if len > 400 {
        score += 2;
    } else if len > 150 {
        score += 1;
    }

    let criteria = task.acceptance_criteria.len();
    if criteria > 5 {
        score += 2;
    } else if criteria > 2 {
        score += 1;
    }

    if task.priority == Priority::Critical {
        score += 1;
    }

    let category = task.category.trim().to_lowercase();
    if COMPLEX_CATEGORIES.contains(&category.as_str()) {
        score += 2;
    } else if TRIVIAL_CATEGORIES.contains(&category.as_str()) {
        score -= 1;
    }

    score
}
