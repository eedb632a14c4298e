//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A scripted provider that plays worker, judge and planner
//! - A config tuned for fast runs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use foreman::config::{Config, WorkerCapacity};
use foreman::core::{Task, TaskId, Tier};
use foreman::orchestration::{Factory, FactoryEvent, Invocation, Provider, ProviderOutput};
use foreman::session::{Session, SessionStore};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo directory");

        git(&path, &["init"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// State directory for the session store, next to the repo.
    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    /// Global worktree directory, next to the repo.
    pub fn worktrees_dir(&self) -> PathBuf {
        self.temp_dir.path().join("worktrees")
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(&self.state_dir())
    }

    /// Branches under the `foreman/` namespace.
    pub fn foreman_branches(&self) -> Vec<String> {
        let output = Command::new("git")
            .args(["for-each-ref", "--format=%(refname:short)", "refs/heads/foreman/"])
            .current_dir(&self.path)
            .output()
            .expect("Failed to list branches");

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Directories left under the worktree root for a session.
    pub fn leftover_worktrees(&self, session: &Session) -> Vec<PathBuf> {
        let root = self.worktrees_dir().join(session.id.short());
        match std::fs::read_dir(&root) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// A session over `tasks`, not yet started.
    pub fn session(&self, tasks: Vec<Task>) -> Session {
        Session::new(&self.path, &self.worktrees_dir(), tasks)
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Config for fast runs: no planner, no default judges, short grace.
pub fn test_config(workers: WorkerCapacity) -> Config {
    let mut config = Config::default();
    config.workers = workers;
    config.planner.enabled = false;
    config.worker_timeout_secs = 30;
    config.judge_timeout_secs = 10;
    config.abort_grace_secs = 1;
    config
}

pub fn capacity(fast: usize, balanced: usize, powerful: usize) -> WorkerCapacity {
    WorkerCapacity {
        fast,
        balanced,
        powerful,
    }
}

/// Create a test task with the given id.
pub fn test_task(id: &str) -> Task {
    Task::new(id, &format!("Implement {}", id))
}

/// What a prompt asked the provider to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Worker(TaskId),
    Judge(String),
    Planner,
}

pub fn classify(prompt: &str) -> Role {
    if let Some(rest) = prompt.strip_prefix("You are working on task ") {
        let id = rest.split_whitespace().next().unwrap_or_default();
        return Role::Worker(TaskId::new(id));
    }
    if let Some(rest) = prompt.strip_prefix("You are acting as a ") {
        let persona = rest
            .split(" reviewing a change")
            .next()
            .unwrap_or_default()
            .to_string();
        return Role::Judge(persona);
    }
    Role::Planner
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerScript {
    /// Write `<task>.txt` into the worktree and exit 0.
    Succeed,
    /// Exit 1 without touching anything.
    Crash,
    /// Like `Succeed`, after a pause.
    Slow(Duration),
    /// Block until cancelled.
    Hang,
}

/// Plays every role from a script and records what it was asked.
pub struct ScriptedProvider {
    worker: WorkerScript,
    per_task: HashMap<TaskId, WorkerScript>,
    judges: HashMap<String, String>,
    planner: Mutex<Vec<String>>,
    dispatches: Mutex<Vec<(TaskId, Tier)>>,
    judge_calls: AtomicUsize,
    planner_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(worker: WorkerScript) -> Self {
        Self {
            worker,
            per_task: HashMap::new(),
            judges: HashMap::new(),
            planner: Mutex::new(Vec::new()),
            dispatches: Mutex::new(Vec::new()),
            judge_calls: AtomicUsize::new(0),
            planner_calls: AtomicUsize::new(0),
        }
    }

    /// Script for one task instead of the default.
    pub fn with_worker_for(mut self, id: &str, script: WorkerScript) -> Self {
        self.per_task.insert(TaskId::new(id), script);
        self
    }

    /// Answer for a judge persona.
    pub fn with_judge(mut self, persona: &str, stdout: &str) -> Self {
        self.judges.insert(persona.to_string(), stdout.to_string());
        self
    }

    /// Planner answers, handed out in order; later rounds get `{}`.
    pub fn with_plans(self, plans: &[&str]) -> Self {
        *self.planner.lock().unwrap() = plans.iter().rev().map(|p| p.to_string()).collect();
        self
    }

    /// Every worker call, in order.
    pub fn dispatches(&self) -> Vec<(TaskId, Tier)> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn dispatches_for(&self, id: &str) -> Vec<Tier> {
        self.dispatches()
            .into_iter()
            .filter(|(task, _)| task.as_str() == id)
            .map(|(_, tier)| tier)
            .collect()
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn planner_calls(&self) -> usize {
        self.planner_calls.load(Ordering::SeqCst)
    }
}

fn output(stdout: &str, exit_code: i32) -> ProviderOutput {
    ProviderOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code,
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn invoke(&self, invocation: Invocation) -> foreman::Result<ProviderOutput> {
        match classify(&invocation.prompt) {
            Role::Worker(id) => {
                self.dispatches.lock().unwrap().push((id.clone(), invocation.tier));
                let script = self.per_task.get(&id).copied().unwrap_or(self.worker);
                if let WorkerScript::Slow(pause) = script {
                    tokio::time::sleep(pause).await;
                }
                match script {
                    WorkerScript::Succeed | WorkerScript::Slow(_) => {
                        std::fs::write(
                            invocation.working_dir.join(format!("{}.txt", id.slug())),
                            format!("work for {}\n", id),
                        )?;
                        Ok(output("Added the file.", 0))
                    }
                    WorkerScript::Crash => Ok(output("", 1)),
                    WorkerScript::Hang => {
                        invocation.cancel.cancelled().await;
                        Err(foreman::Error::Cancelled)
                    }
                }
            }
            Role::Judge(persona) => {
                self.judge_calls.fetch_add(1, Ordering::SeqCst);
                let answer = self
                    .judges
                    .get(&persona)
                    .cloned()
                    .unwrap_or_else(|| r#"{"passed": true, "confidence": 0.9}"#.to_string());
                Ok(output(&answer, 0))
            }
            Role::Planner => {
                self.planner_calls.fetch_add(1, Ordering::SeqCst);
                let plan = self.planner.lock().unwrap().pop().unwrap_or_else(|| "{}".to_string());
                Ok(output(&plan, 0))
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// A started factory plus the receiving end of its event stream.
pub struct Harness {
    pub factory: Factory,
    pub events: mpsc::UnboundedReceiver<FactoryEvent>,
}

/// Start a session over `tasks` and build its factory.
pub fn start_factory(repo: &TestRepo, config: &Config, provider: Arc<ScriptedProvider>, tasks: Vec<Task>) -> Harness {
    let store = repo.store();
    let mut session = repo.session(tasks);
    let lock = store.start(&mut session).expect("Failed to start session");
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = Factory::new(config, provider, store, session, lock)
        .expect("Failed to build factory")
        .with_events(tx)
        .with_abort_poll(Duration::from_millis(50));
    Harness { factory, events: rx }
}

/// Everything sent on the event stream so far.
pub fn drain(events: &mut mpsc::UnboundedReceiver<FactoryEvent>) -> Vec<FactoryEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
