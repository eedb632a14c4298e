//! Agent provider abstraction.
//!
//! A provider turns a prompt into an agent run inside a working directory.
//! The factory, the judges and the planner all talk to agents through the
//! [`Provider`] trait; [`CommandProvider`] implements it by launching the
//! agent CLI as a subprocess.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::Tier;
use crate::error::{Error, Result};

/// One request to an agent.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tier: Tier,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Invocation {
    pub fn new(tier: Tier, prompt: impl Into<String>, working_dir: &Path, timeout: Duration) -> Self {
        Self {
            tier,
            prompt: prompt.into(),
            working_dir: working_dir.to_path_buf(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What came back from an agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ProviderOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Short description of a failed run for logs and task errors.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            format!(
                "exited with code {}: {}",
                self.exit_code,
                crate::util::tail_chars(stderr, 500)
            )
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Run the agent. Spawn failures, timeouts and cancellation are errors;
    /// a non-zero exit is reported through [`ProviderOutput::exit_code`].
    async fn invoke(&self, invocation: Invocation) -> Result<ProviderOutput>;

    fn name(&self) -> &str;
}

/// Supported agent CLIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Claude,
    Codex,
    /// Any other program. `{prompt}` and `{model}` in `args` are substituted;
    /// without a `{prompt}` placeholder the prompt is appended last.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl ProviderKind {
    pub fn program(&self) -> &str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Codex => "codex",
            ProviderKind::Command { program, .. } => program,
        }
    }

    pub fn default_model(&self, tier: Tier) -> Option<&'static str> {
        match self {
            ProviderKind::Claude => Some(match tier {
                Tier::Fast => "haiku",
                Tier::Balanced => "sonnet",
                Tier::Powerful => "opus",
            }),
            ProviderKind::Codex | ProviderKind::Command { .. } => None,
        }
    }

    /// Command-line arguments for one run.
    pub fn build_args(&self, model: Option<&str>, prompt: &str) -> Vec<String> {
        match self {
            ProviderKind::Claude => {
                let mut args = vec![
                    "-p".to_string(),
                    prompt.to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                ];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                args
            }
            ProviderKind::Codex => {
                let mut args = vec!["exec".to_string(), "--full-auto".to_string()];
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.to_string());
                }
                args.push(prompt.to_string());
                args
            }
            ProviderKind::Command { args, .. } => {
                let mut has_prompt = false;
                let mut out: Vec<String> = args
                    .iter()
                    .map(|arg| {
                        if arg.contains("{prompt}") {
                            has_prompt = true;
                        }
                        arg.replace("{prompt}", prompt)
                            .replace("{model}", model.unwrap_or(""))
                    })
                    .collect();
                if !has_prompt {
                    out.push(prompt.to_string());
                }
                out
            }
        }
    }

    /// Pull the agent's answer text out of raw stdout.
    ///
    /// Claude's JSON envelope carries the text in `result`; other providers
    /// print it directly.
    pub fn extract_text(&self, stdout: &str) -> String {
        if matches!(self, ProviderKind::Claude) {
            if let Ok(raw) = serde_json::from_str::<RawClaudeResponse>(stdout.trim()) {
                if let Some(result) = raw.result {
                    return result;
                }
                if let Some(error) = raw.error {
                    return error;
                }
            }
        }
        stdout.trim().to_string()
    }
}

#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Model names per tier. Unset tiers fall back to the provider default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierModels {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balanced: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powerful: Option<String>,
}

impl TierModels {
    pub fn get(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Fast => self.fast.as_deref(),
            Tier::Balanced => self.balanced.as_deref(),
            Tier::Powerful => self.powerful.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub models: TierModels,
}

impl ProviderConfig {
    pub fn model_for(&self, tier: Tier) -> Option<String> {
        self.models
            .get(tier)
            .map(str::to_string)
            .or_else(|| self.kind.default_model(tier).map(str::to_string))
    }
}

/// Runs the configured agent CLI through `tokio::process`.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    config: ProviderConfig,
    binary: PathBuf,
    grace: Duration,
}

impl CommandProvider {
    /// Locate the provider binary on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProviderNotAvailable`] if the binary cannot be found.
    pub fn new(config: ProviderConfig, grace: Duration) -> Result<Self> {
        let program = config.kind.program().to_string();
        let binary =
            which::which(&program).map_err(|_| Error::ProviderNotAvailable(program.clone()))?;
        Ok(Self {
            config,
            binary,
            grace,
        })
    }

    /// Use a specific binary path, skipping the `PATH` lookup.
    pub fn with_binary(config: ProviderConfig, binary: PathBuf, grace: Duration) -> Self {
        Self {
            config,
            binary,
            grace,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl Provider for CommandProvider {
    async fn invoke(&self, invocation: Invocation) -> Result<ProviderOutput> {
        let model = self.config.model_for(invocation.tier);
        let args = self
            .config
            .kind
            .build_args(model.as_deref(), &invocation.prompt);
        debug!(
            provider = self.config.kind.program(),
            tier = %invocation.tier,
            model = model.as_deref().unwrap_or("default"),
            prompt_len = invocation.prompt.len(),
            dir = %invocation.working_dir.display(),
            "invoking provider"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).current_dir(&invocation.working_dir);
        let mut output = run_process(cmd, invocation.timeout, &invocation.cancel, self.grace).await?;
        output.stdout = self.config.kind.extract_text(&output.stdout);
        Ok(output)
    }

    fn name(&self) -> &str {
        self.config.kind.program()
    }
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Spawn `cmd`, collect its output, and enforce the timeout and cancellation.
///
/// The child leads its own process group, so signals reach anything it
/// started. The timeout covers both the child's exit and draining its
/// pipes; a background descendant still holding stdout past the deadline is
/// killed and the run counts as timed out. On cancellation the group gets
/// SIGTERM and `grace` to exit before being killed. `kill_on_drop` covers
/// the case where the calling future itself is aborted.
pub(crate) async fn run_process(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<ProviderOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn()?;
    let group = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_task = tokio::spawn(read_all(stdout));
    let stderr_task = tokio::spawn(read_all(stderr));

    let waited = tokio::select! {
        status = child.wait() => Waited::Exited(status),
        _ = sleep_until(deadline) => Waited::TimedOut,
        _ = cancel.cancelled() => Waited::Cancelled,
    };

    let status = match waited {
        Waited::Exited(status) => status?,
        Waited::TimedOut => {
            warn!(timeout_secs = timeout.as_secs(), "subprocess timed out, killing");
            kill_group(group, "KILL").await;
            let _ = child.kill().await;
            return Err(Error::Timeout(timeout));
        }
        Waited::Cancelled => {
            terminate(&mut child, group, grace).await;
            return Err(Error::Cancelled);
        }
    };

    let drained = tokio::select! {
        out = async { tokio::join!(stdout_task, stderr_task) } => Some(out),
        _ = sleep_until(deadline) => None,
        _ = cancel.cancelled() => {
            kill_group(group, "KILL").await;
            return Err(Error::Cancelled);
        }
    };
    let Some((stdout, stderr)) = drained else {
        warn!(
            timeout_secs = timeout.as_secs(),
            "subprocess exited but its descendants kept the output open, killing"
        );
        kill_group(group, "KILL").await;
        return Err(Error::Timeout(timeout));
    };
    Ok(ProviderOutput {
        stdout: String::from_utf8_lossy(&stdout.unwrap_or_default()).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.unwrap_or_default()).into_owned(),
        exit_code: status.code().unwrap_or(-1),
    })
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        let _ = reader.read_to_end(&mut buf).await;
    }
    buf
}

/// Send `signal` to the process group led by `group`. The group may be
/// gone already.
async fn kill_group(group: Option<u32>, signal: &str) {
    let Some(pgid) = group else {
        return;
    };
    let _ = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

async fn terminate(child: &mut tokio::process::Child, group: Option<u32>, grace: Duration) {
    kill_group(group, "TERM").await;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("subprocess exited within grace period"),
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "subprocess ignored SIGTERM, killing");
            let _ = child.kill().await;
        }
    }
    // Descendants that outlived the leader.
    kill_group(group, "KILL").await;
}
