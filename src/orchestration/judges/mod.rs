//! Judge panel: independent LLM personas that accept or reject an attempt.
//!
//! Each judge gets the task, the diff and the worker's summary, and answers
//! with a verdict. The panel aggregates verdicts into one pass/fail where
//! only required judges can block.

pub mod decode;
pub mod format;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::JudgeConfig;
use crate::orchestration::provider::{Invocation, Provider};
use crate::util::truncate_chars;

pub use decode::{decode, decode_heuristic, decode_structured};
pub use format::{format_console, format_discord, DEFAULT_DISCORD_CAP};

/// Longest diff handed to a judge.
const MAX_DIFF_CHARS: usize = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    /// All judges at once.
    #[default]
    Parallel,
    /// One at a time, stopping at the first failing required judge.
    SequentialFailFast,
}

/// Everything a judge sees about an attempt.
#[derive(Debug, Clone, Default)]
pub struct JudgeContext {
    pub task_description: String,
    pub acceptance_criteria: Vec<String>,
    pub diff: String,
    pub worker_summary: String,
    pub evidence_path: Option<PathBuf>,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub persona: String,
    #[serde(default = "default_true")]
    pub required: bool,
    pub passed: bool,
    pub verdict: String,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl JudgeResult {
    /// Result for a judge whose call never produced a verdict.
    pub fn evaluation_failed(persona: &str, error: &str) -> Self {
        Self {
            persona: persona.to_string(),
            required: true,
            passed: false,
            verdict: "Evaluation failed".to_string(),
            reasoning: error.to_string(),
            confidence: 0.0,
            suggestions: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Whether this result blocks the aggregate.
    pub fn blocks(&self) -> bool {
        self.required && !self.passed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedJudgeResult {
    pub passed: bool,
    pub results: Vec<JudgeResult>,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl AggregatedJudgeResult {
    pub fn from_results(results: Vec<JudgeResult>) -> Self {
        if results.is_empty() {
            return Self {
                passed: true,
                results,
                summary: "No judges configured".to_string(),
                timestamp: Utc::now(),
            };
        }

        let failed_required: Vec<&str> = results
            .iter()
            .filter(|r| r.blocks())
            .map(|r| r.persona.as_str())
            .collect();
        let failed_optional = results.iter().filter(|r| !r.required && !r.passed).count();
        let passed = failed_required.is_empty();

        let summary = if passed {
            let mut s = format!("{}/{} judges passed", results.len() - failed_optional, results.len());
            if failed_optional > 0 {
                s.push_str(&format!(" ({} optional judge(s) raised concerns)", failed_optional));
            }
            s
        } else {
            format!("Failed required judges: {}", failed_required.join(", "))
        };

        Self {
            passed,
            results,
            summary,
            timestamp: Utc::now(),
        }
    }

    /// Personas of required judges that did not pass.
    pub fn failed_required(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.blocks())
            .map(|r| r.persona.clone())
            .collect()
    }

    /// Suggestions from every judge, exact duplicates removed, first seen first.
    pub fn merged_suggestions(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.results
            .iter()
            .flat_map(|r| r.suggestions.iter())
            .filter(|s| seen.insert(s.as_str()))
            .cloned()
            .collect()
    }
}

/// Criteria used when a judge config does not name its own.
pub fn default_criteria(persona: &str) -> Vec<String> {
    let p = persona.to_lowercase();
    let items: &[&str] = if p.contains("security") {
        &[
            "No injection, path traversal or unsafe deserialization",
            "Secrets and credentials are never logged or committed",
            "Input from outside the process is validated",
        ]
    } else if p.contains("qa") || p.contains("test") {
        &[
            "Acceptance criteria are met",
            "New behaviour is covered by tests",
            "Edge cases and error paths are handled",
        ]
    } else if p.contains("architect") || p.contains("design") {
        &[
            "Change fits the existing module structure",
            "No needless duplication or new coupling",
            "Public interfaces stay coherent",
        ]
    } else if p.contains("perf") {
        &[
            "No accidental quadratic work or repeated I/O",
            "Allocations in hot paths are justified",
        ]
    } else {
        &[
            "The change does what the task asks",
            "Code is correct and readable",
            "Nothing unrelated was modified",
        ]
    };
    items.iter().map(|s| s.to_string()).collect()
}

/// Prompt for one judge.
pub fn build_prompt(judge: &JudgeConfig, ctx: &JudgeContext) -> String {
    let criteria = judge
        .criteria
        .clone()
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| default_criteria(&judge.persona));
    let criteria_list = criteria
        .iter()
        .map(|c| format!("- {}", c))
        .collect::<Vec<_>>()
        .join("\n");

    let acceptance = if ctx.acceptance_criteria.is_empty() {
        "None listed.".to_string()
    } else {
        ctx.acceptance_criteria
            .iter()
            .map(|c| format!("- {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let evidence = match (&ctx.evidence_path, judge.require_evidence) {
        (Some(path), _) => format!("\n## Evidence\nVisual evidence is at: {}\n", path.display()),
        (None, true) => "\n## Evidence\nNOTE: No visual evidence is available for this change. \
             Judge from the diff and summary only.\n"
            .to_string(),
        (None, false) => String::new(),
    };

    let diff = if ctx.diff.trim().is_empty() {
        "(no changes)".to_string()
    } else {
        truncate_chars(&ctx.diff, MAX_DIFF_CHARS)
    };

    format!(
        r#"You are acting as a {persona} reviewing a change made by an autonomous coding agent.

## Task
{task}

## Acceptance Criteria
{acceptance}

## Your Review Criteria
{criteria_list}
{evidence}
## Worker Summary
{summary}

## Diff
```diff
{diff}
```

Respond with a single JSON object:

```json
{{
  "passed": true,
  "verdict": "one-line verdict",
  "reasoning": "why",
  "confidence": 0.0,
  "suggestions": ["optional improvements"]
}}
```
"#,
        persona = judge.persona,
        task = ctx.task_description,
        summary = ctx.worker_summary.trim(),
    )
}

/// Runs judges through a provider and aggregates their verdicts.
pub struct JudgePanel {
    provider: Arc<dyn Provider>,
    mode: JudgeMode,
    timeout: Duration,
    cancel: CancellationToken,
}

impl JudgePanel {
    pub fn new(provider: Arc<dyn Provider>, mode: JudgeMode, timeout: Duration) -> Self {
        Self {
            provider,
            mode,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run_judges(&self, judges: &[JudgeConfig], ctx: &JudgeContext) -> AggregatedJudgeResult {
        if judges.is_empty() {
            debug!("no judges configured, passing");
            return AggregatedJudgeResult::from_results(Vec::new());
        }

        let results = match self.mode {
            JudgeMode::Parallel => join_all(judges.iter().map(|j| self.run_one(j, ctx))).await,
            JudgeMode::SequentialFailFast => {
                let mut results = Vec::with_capacity(judges.len());
                for judge in judges {
                    let result = self.run_one(judge, ctx).await;
                    let stop = result.blocks();
                    results.push(result);
                    if stop {
                        debug!(persona = %judge.persona, "required judge failed, stopping panel");
                        break;
                    }
                }
                results
            }
        };

        let aggregate = AggregatedJudgeResult::from_results(results);
        info!(
            passed = aggregate.passed,
            judges = aggregate.results.len(),
            summary = %aggregate.summary,
            "judge panel finished"
        );
        aggregate
    }

    async fn run_one(&self, judge: &JudgeConfig, ctx: &JudgeContext) -> JudgeResult {
        let prompt = build_prompt(judge, ctx);
        let invocation = Invocation::new(judge.model, prompt, &ctx.working_dir, self.timeout)
            .with_cancel(self.cancel.clone());

        let mut result = match self.provider.invoke(invocation).await {
            Ok(out) if out.success() => decode(&judge.persona, &out.stdout),
            Ok(out) => {
                warn!(persona = %judge.persona, exit_code = out.exit_code, "judge call failed");
                JudgeResult::evaluation_failed(&judge.persona, &out.failure_message())
            }
            Err(e) => {
                warn!(persona = %judge.persona, error = %e, "judge call failed");
                JudgeResult::evaluation_failed(&judge.persona, &e.to_string())
            }
        };
        result.required = judge.required;
        debug!(
            persona = %result.persona,
            passed = result.passed,
            confidence = result.confidence,
            "judge verdict"
        );
        result
    }
}
