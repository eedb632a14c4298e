use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::{JudgeConfig, Tier};
use crate::orchestration::gates::{GateConfig, GateMode};
use crate::orchestration::judges::JudgeMode;
use crate::orchestration::provider::ProviderConfig;
use crate::{Error, Result};

/// Worker slots per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCapacity {
    pub fast: usize,
    pub balanced: usize,
    pub powerful: usize,
}

impl Default for WorkerCapacity {
    fn default() -> Self {
        Self {
            fast: 3,
            balanced: 2,
            powerful: 1,
        }
    }
}

impl WorkerCapacity {
    pub fn get(&self, tier: Tier) -> usize {
        match tier {
            Tier::Fast => self.fast,
            Tier::Balanced => self.balanced,
            Tier::Powerful => self.powerful,
        }
    }

    pub fn set(&mut self, tier: Tier, capacity: usize) {
        match tier {
            Tier::Fast => self.fast = capacity,
            Tier::Balanced => self.balanced = capacity,
            Tier::Powerful => self.powerful = capacity,
        }
    }

    pub fn total(&self) -> usize {
        self.fast + self.balanced + self.powerful
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub model: Tier,
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            model: Tier::Balanced,
            timeout_secs: 300,
        }
    }
}

impl PlannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workers: WorkerCapacity,
    pub retry_limit: u32,
    pub escalate_on_retry: bool,
    pub auto_route: bool,
    pub default_tier: Tier,
    pub cleanup_worktrees: bool,
    pub worker_timeout_secs: u64,
    pub judge_timeout_secs: u64,
    pub judge_mode: JudgeMode,
    pub gate_mode: GateMode,
    pub gates: Vec<GateConfig>,
    /// Judges applied to tasks whose backlog entry lists none.
    pub default_judges: Vec<JudgeConfig>,
    pub planner: PlannerConfig,
    pub provider: ProviderConfig,
    pub worktree_dir: Option<String>,
    pub session_retention_days: u64,
    pub notify_char_limit: usize,
    pub abort_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: WorkerCapacity::default(),
            retry_limit: 3,
            escalate_on_retry: true,
            auto_route: true,
            default_tier: Tier::Balanced,
            cleanup_worktrees: true,
            worker_timeout_secs: 1800,
            judge_timeout_secs: 300,
            judge_mode: JudgeMode::default(),
            gate_mode: GateMode::default(),
            gates: Vec::new(),
            default_judges: Vec::new(),
            planner: PlannerConfig::default(),
            provider: ProviderConfig::default(),
            worktree_dir: None,
            session_retention_days: 7,
            notify_char_limit: 1900,
            abort_grace_secs: 10,
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::foreman_dir()?.join("worktrees")),
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            retry_limit = config.retry_limit,
            gates = config.gates.len(),
            planner = config.planner.enabled,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    /// Reject configurations the factory cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers.total() == 0 {
            return Err(Error::Validation(
                "at least one tier needs a worker slot".to_string(),
            ));
        }
        if self.retry_limit == 0 {
            return Err(Error::Validation("retry_limit must be at least 1".to_string()));
        }
        if self.planner.enabled && self.planner.interval_secs == 0 {
            return Err(Error::Validation(
                "planner.interval_secs must be positive".to_string(),
            ));
        }
        if self.notify_char_limit == 0 {
            return Err(Error::Validation(
                "notify_char_limit must be positive".to_string(),
            ));
        }
        if self.workers.get(self.default_tier) == 0 && !self.auto_route {
            return Err(Error::Validation(format!(
                "default tier '{}' has no worker slots",
                self.default_tier
            )));
        }
        for gate in &self.gates {
            if gate.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "gate '{}' has an empty command",
                    gate.name
                )));
            }
        }
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::foreman_dir()?;
        let worktrees = self.worktrees_dir()?;
        for d in [&dir, &worktrees] {
            if !d.exists() {
                debug!(dir = %d.display(), "creating directory");
                fs::create_dir_all(d)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
