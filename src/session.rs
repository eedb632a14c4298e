//! Session checkpoints for resume and abort.
//!
//! A session is one supervised factory run. Its checkpoint lives at
//! `<state_dir>/sessions/<id>.json` and is rewritten after every task state
//! transition. The orchestrator that owns a session holds an exclusive lock
//! on `<id>.lock` for as long as it runs, which is how a crashed session is
//! told apart from a live one. Finished sessions move to `sessions/archive/`.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::core::{Backlog, ProgressSnapshot, Task, TaskId, Tier};
use crate::orchestration::workspace::{CleanupReport, WorkspaceManager};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Aborted,
    Crashed,
}

impl SessionStatus {
    /// Completed and aborted sessions cannot be resumed.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Aborted => write!(f, "aborted"),
            SessionStatus::Crashed => write!(f, "crashed"),
        }
    }
}

/// An attempt that was running when the checkpoint was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub tier: Tier,
    pub attempt: u32,
    pub worktree: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub repo_path: PathBuf,
    /// Global worktree directory; this session's worktrees sit under
    /// `<worktrees_dir>/<short id>`.
    pub worktrees_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_path: Option<PathBuf>,
    #[serde(default)]
    pub worktree_paths: BTreeSet<PathBuf>,
    /// Worktrees of finished attempts left on disk because cleanup is off.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub retained_worktrees: BTreeSet<PathBuf>,
    #[serde(default)]
    pub active_tasks: BTreeMap<TaskId, WorkerHandle>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Session {
    pub fn new(repo_path: &Path, worktrees_dir: &Path, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            started_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            repo_path: repo_path.to_path_buf(),
            worktrees_dir: worktrees_dir.to_path_buf(),
            backlog_path: None,
            worktree_paths: BTreeSet::new(),
            retained_worktrees: BTreeSet::new(),
            active_tasks: BTreeMap::new(),
            tasks,
        }
    }

    pub fn with_backlog_path(mut self, path: &Path) -> Self {
        self.backlog_path = Some(path.to_path_buf());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn register_worker(&mut self, task_id: &TaskId, handle: WorkerHandle) {
        self.worktree_paths.insert(handle.worktree.clone());
        self.active_tasks.insert(task_id.clone(), handle);
    }

    pub fn release_worker(&mut self, task_id: &TaskId) -> Option<WorkerHandle> {
        let handle = self.active_tasks.remove(task_id)?;
        self.worktree_paths.remove(&handle.worktree);
        Some(handle)
    }

    /// Release the worker but keep its worktree out of any later reclaim.
    pub fn retain_worker(&mut self, task_id: &TaskId) -> Option<WorkerHandle> {
        let handle = self.release_worker(task_id)?;
        self.retained_worktrees.insert(handle.worktree.clone());
        Some(handle)
    }

    pub fn progress(&self) -> ProgressSnapshot {
        match Backlog::from_tasks(self.tasks.clone()) {
            Ok(backlog) => backlog.counts(),
            Err(_) => ProgressSnapshot {
                total: self.tasks.len(),
                ..Default::default()
            },
        }
    }

    /// Manager for this session's worktree root.
    pub fn workspaces(&self) -> Result<WorkspaceManager> {
        WorkspaceManager::new(&self.repo_path, &self.worktrees_dir, &self.id.short())
    }

    /// Put every interrupted task back in the queue and forget its worker.
    pub fn requeue_interrupted(&mut self) -> Vec<TaskId> {
        let mut requeued = Vec::new();
        for task in &mut self.tasks {
            if task.status.is_in_flight() {
                task.reset_interrupted();
                requeued.push(task.id.clone());
            }
        }
        self.active_tasks.clear();
        self.worktree_paths.clear();
        requeued
    }

    /// Remove every worktree this session owns, known or orphaned. Failures
    /// are logged and reported.
    pub fn reclaim_worktrees(&self) -> CleanupReport {
        match self.workspaces() {
            Ok(manager) => {
                let report = manager.reclaim_all(&self.worktree_paths, &self.retained_worktrees);
                for (path, error) in &report.failed {
                    warn!(session = %self.id, path = %path.display(), error = %error, "worktree not reclaimed");
                }
                report
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "cannot open repository to reclaim worktrees");
                CleanupReport {
                    failed: self
                        .worktree_paths
                        .iter()
                        .map(|p| (p.clone(), e.to_string()))
                        .collect(),
                    ..Default::default()
                }
            }
        }
    }
}

/// Exclusive liveness lock on a session. Released on drop.
///
/// The lock file stays on disk afterwards. Unlinking it would let a process
/// that already opened it lock an inode nobody else can see.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// What `abort` did.
#[derive(Debug)]
pub enum AbortOutcome {
    /// The session was live; its orchestrator was asked to stop.
    Signalled,
    /// Nobody held the session; it was aborted here.
    Aborted {
        requeued: Vec<TaskId>,
        cleanup: CleanupReport,
    },
}

/// A session taken over by `resume`.
#[derive(Debug)]
pub struct ResumedSession {
    pub session: Session,
    pub lock: SessionLock,
    pub requeued: Vec<TaskId>,
    pub cleanup: CleanupReport,
}

pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Store rooted at `<state_dir>/sessions`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("sessions"),
        }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(&Config::foreman_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn archive_dir(&self) -> PathBuf {
        self.dir.join("archive")
    }

    fn checkpoint_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn archived_path(&self, id: SessionId) -> PathBuf {
        self.archive_dir().join(format!("{}.json", id))
    }

    fn lock_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.lock", id))
    }

    fn abort_path(&self, id: SessionId) -> PathBuf {
        self.dir.join(format!("{}.abort", id))
    }

    /// Record a new session: take its lock and write the first checkpoint.
    pub fn start(&self, session: &mut Session) -> Result<SessionLock> {
        fs::create_dir_all(&self.dir)?;
        let lock = self.try_lock(session.id)?;
        session.status = SessionStatus::Active;
        self.checkpoint(session)?;
        info!(session = %session.id, tasks = session.tasks.len(), "session started");
        Ok(lock)
    }

    fn try_lock(&self, id: SessionId) -> Result<SessionLock> {
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::SessionLocked(id.to_string()))?;
        Ok(SessionLock { file })
    }

    /// Whether a live orchestrator holds the session.
    pub fn is_live(&self, id: SessionId) -> bool {
        let path = self.lock_path(id);
        if !path.exists() {
            return false;
        }
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => match file.try_lock_exclusive() {
                Ok(()) => {
                    let _ = FileExt::unlock(&file);
                    false
                }
                Err(_) => true,
            },
            Err(_) => false,
        }
    }

    /// Write the checkpoint atomically, keeping the previous copy as `.bak`.
    ///
    /// # Errors
    ///
    /// Any failure is reported as [`Error::Checkpoint`].
    pub fn checkpoint(&self, session: &mut Session) -> Result<()> {
        session.touch();
        self.write_checkpoint(&self.checkpoint_path(session.id), session)
            .map_err(|e| Error::Checkpoint(format!("session {}: {}", session.id, e)))
    }

    fn write_checkpoint(&self, path: &Path, session: &Session) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(session)?;
        if path.exists() {
            fs::copy(path, path.with_extension("json.bak"))?;
        }
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, path)?;
        debug!(session = %session.id, path = %path.display(), "checkpoint written");
        Ok(())
    }

    fn read(path: &Path) -> Result<Session> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load a session from the live or the archive directory.
    ///
    /// A live checkpoint that cannot be parsed falls back to its `.bak`.
    pub fn load(&self, id: SessionId) -> Result<Session> {
        let live = self.checkpoint_path(id);
        if live.exists() {
            return Self::read(&live).or_else(|e| {
                let backup = live.with_extension("json.bak");
                if !backup.exists() {
                    return Err(e);
                }
                warn!(session = %id, error = %e, "checkpoint unreadable, using backup");
                Self::read(&backup)
            });
        }
        let archived = self.archived_path(id);
        if archived.exists() {
            return Self::read(&archived);
        }
        Err(Error::SessionNotFound(id.to_string()))
    }

    /// Resolve a full id or a unique prefix of one.
    pub fn find(&self, prefix: &str) -> Result<Session> {
        if let Ok(id) = prefix.parse::<SessionId>() {
            return self.load(id);
        }
        let mut matches: Vec<Session> = self
            .list()?
            .into_iter()
            .filter(|s| s.id.to_string().starts_with(prefix))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::SessionNotFound(prefix.to_string())),
            n => Err(Error::Validation(format!(
                "session prefix '{}' is ambiguous ({} matches)",
                prefix, n
            ))),
        }
    }

    /// Every session, live and archived, newest first.
    pub fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for dir in [self.dir.clone(), self.archive_dir()] {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read(&path) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!(path = %path.display(), error = %e, "unreadable checkpoint skipped"),
                }
            }
        }
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    pub fn latest(&self) -> Result<Option<Session>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Mark active sessions that nobody holds as crashed.
    pub fn recover_crashed(&self) -> Result<Vec<SessionId>> {
        let mut recovered = Vec::new();
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(recovered);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(mut session) = Self::read(&path) else {
                continue;
            };
            if session.status != SessionStatus::Active {
                continue;
            }
            let Ok(_lock) = self.try_lock(session.id) else {
                continue;
            };
            session.status = SessionStatus::Crashed;
            self.checkpoint(&mut session)?;
            warn!(session = %session.id, "session marked crashed");
            recovered.push(session.id);
        }
        Ok(recovered)
    }

    /// Take over a crashed or interrupted session.
    ///
    /// Worktrees left behind by interrupted attempts are reclaimed along
    /// with any orphans under the session root, and in-flight tasks go back
    /// to pending.
    pub fn resume(&self, id: SessionId) -> Result<ResumedSession> {
        let mut session = self.load(id)?;
        if session.status.is_finished() {
            return Err(Error::Validation(format!(
                "session {} is {} and cannot be resumed",
                id, session.status
            )));
        }
        let lock = self.try_lock(id)?;

        let missing: Vec<PathBuf> = session
            .worktree_paths
            .iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect();
        for path in &missing {
            debug!(path = %path.display(), "checkpointed worktree already gone");
            session.worktree_paths.remove(path);
        }

        let cleanup = session.reclaim_worktrees();
        let requeued = session.requeue_interrupted();
        let _ = fs::remove_file(self.abort_path(id));
        session.status = SessionStatus::Active;
        self.checkpoint(&mut session)?;
        info!(
            session = %id,
            requeued = requeued.len(),
            reclaimed = cleanup.removed.len(),
            "session resumed"
        );
        Ok(ResumedSession {
            session,
            lock,
            requeued,
            cleanup,
        })
    }

    /// Abort a session.
    ///
    /// A live session gets an abort marker that its scheduler picks up.
    /// Anything else is aborted right here.
    pub fn abort(&self, id: SessionId) -> Result<AbortOutcome> {
        let mut session = self.load(id)?;
        if session.status.is_finished() {
            return Err(Error::Validation(format!(
                "session {} is already {}",
                id, session.status
            )));
        }
        let lock = match self.try_lock(id) {
            Ok(lock) => lock,
            Err(Error::SessionLocked(_)) => {
                fs::write(self.abort_path(id), Utc::now().to_rfc3339())?;
                info!(session = %id, "abort requested from live session");
                return Ok(AbortOutcome::Signalled);
            }
            Err(e) => return Err(e),
        };

        let cleanup = session.reclaim_worktrees();
        let requeued = session.requeue_interrupted();
        self.finish(&mut session, SessionStatus::Aborted, lock)?;
        Ok(AbortOutcome::Aborted { requeued, cleanup })
    }

    pub fn abort_requested(&self, id: SessionId) -> bool {
        self.abort_path(id).exists()
    }

    /// Archive a session that ran to the end.
    pub fn complete(&self, session: &mut Session, lock: SessionLock) -> Result<()> {
        self.finish(session, SessionStatus::Completed, lock)
    }

    /// Write the final checkpoint into the archive and release the lock.
    pub fn finish(&self, session: &mut Session, status: SessionStatus, lock: SessionLock) -> Result<()> {
        session.status = status;
        session.touch();
        self.write_checkpoint(&self.archived_path(session.id), session)
            .map_err(|e| Error::Checkpoint(format!("session {}: {}", session.id, e)))?;
        for path in [
            self.checkpoint_path(session.id),
            self.checkpoint_path(session.id).with_extension("json.bak"),
            self.abort_path(session.id),
        ] {
            let _ = fs::remove_file(path);
        }
        drop(lock);
        info!(session = %session.id, status = %status, "session archived");
        Ok(())
    }

    /// Delete sessions that are not active and were last updated before
    /// the retention window.
    pub fn cleanup(&self, retention: Duration) -> Result<Vec<SessionId>> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::Validation(format!("retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;
        let mut removed = Vec::new();
        for session in self.list()? {
            if session.status == SessionStatus::Active || session.updated_at >= cutoff {
                continue;
            }
            if self.is_live(session.id) {
                continue;
            }
            let live = self.checkpoint_path(session.id);
            for path in [
                live.clone(),
                live.with_extension("json.bak"),
                self.archived_path(session.id),
                self.archived_path(session.id).with_extension("json.bak"),
                self.lock_path(session.id),
                self.abort_path(session.id),
            ] {
                if path.exists() {
                    fs::remove_file(&path)?;
                }
            }
            debug!(session = %session.id, "expired session removed");
            removed.push(session.id);
        }
        Ok(removed)
    }
}
