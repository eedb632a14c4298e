//! Validation gates: build, test, lint and custom shell checks.
//!
//! Gates run in the attempt's worktree before any judge is consulted. A gate
//! that times out is reported exactly like a gate that exits non-zero.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::orchestration::provider::run_process;
use crate::util::tail_chars;

fn default_gate_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Build,
    Test,
    Lint,
    Custom,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateKind::Build => write!(f, "build"),
            GateKind::Test => write!(f, "test"),
            GateKind::Lint => write!(f, "lint"),
            GateKind::Custom => write!(f, "custom"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub kind: GateKind,
    /// Run through `sh -c` in the worktree.
    pub command: String,
    #[serde(default = "default_gate_timeout")]
    pub timeout_secs: u64,
}

impl GateConfig {
    pub fn new(name: &str, kind: GateKind, command: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            command: command.to_string(),
            timeout_secs: default_gate_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Run every gate and report all results.
    #[default]
    RunAll,
    /// Stop at the first failing gate.
    FailFast,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Passed,
    Failed { exit_code: i32 },
    TimedOut,
    /// The command could not be started.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub name: String,
    pub kind: GateKind,
    pub outcome: GateOutcome,
    /// Tail of combined stdout/stderr.
    pub output: String,
    pub duration: Duration,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.outcome == GateOutcome::Passed
    }
}

#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(GateResult::passed)
    }

    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed())
    }

    pub fn summary(&self) -> String {
        match self.first_failure() {
            None => format!("{} gate(s) passed", self.results.len()),
            Some(failed) => {
                let reason = match &failed.outcome {
                    GateOutcome::Failed { exit_code } => format!("exit code {}", exit_code),
                    GateOutcome::TimedOut => "timed out".to_string(),
                    GateOutcome::Error(e) => e.clone(),
                    GateOutcome::Passed => "passed".to_string(),
                };
                format!("gate '{}' ({}) failed: {}", failed.name, failed.kind, reason)
            }
        }
    }
}

const OUTPUT_TAIL_CHARS: usize = 2000;

pub struct GateRunner {
    gates: Vec<GateConfig>,
    mode: GateMode,
    grace: Duration,
}

impl GateRunner {
    pub fn new(gates: Vec<GateConfig>, mode: GateMode, grace: Duration) -> Self {
        Self { gates, mode, grace }
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run the configured gates in order inside `dir`.
    pub async fn run(&self, dir: &Path, cancel: &CancellationToken) -> GateReport {
        let mut report = GateReport::default();
        for gate in &self.gates {
            if cancel.is_cancelled() {
                break;
            }
            let result = self.run_gate(gate, dir, cancel).await;
            let failed = !result.passed();
            report.results.push(result);
            if failed && self.mode == GateMode::FailFast {
                break;
            }
        }
        report
    }

    async fn run_gate(&self, gate: &GateConfig, dir: &Path, cancel: &CancellationToken) -> GateResult {
        let timeout = Duration::from_secs(gate.timeout_secs);
        let start = Instant::now();
        debug!(gate = %gate.name, kind = %gate.kind, "running gate");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&gate.command).current_dir(dir);

        let (outcome, output) = match run_process(cmd, timeout, cancel, self.grace).await {
            Ok(out) => {
                let combined = format!("{}{}", out.stdout, out.stderr);
                let outcome = if out.success() {
                    GateOutcome::Passed
                } else {
                    GateOutcome::Failed {
                        exit_code: out.exit_code,
                    }
                };
                (outcome, tail_chars(&combined, OUTPUT_TAIL_CHARS).to_string())
            }
            Err(Error::Timeout(_)) => (GateOutcome::TimedOut, String::new()),
            Err(e) => (GateOutcome::Error(e.to_string()), String::new()),
        };

        let duration = start.elapsed();
        if outcome == GateOutcome::Passed {
            info!(gate = %gate.name, elapsed_ms = duration.as_millis() as u64, "gate passed");
        } else {
            warn!(gate = %gate.name, outcome = ?outcome, "gate failed");
        }

        GateResult {
            name: gate.name.clone(),
            kind: gate.kind,
            outcome,
            output,
            duration,
        }
    }
}
