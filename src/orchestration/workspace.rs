//! Isolated git worktrees, one per in-flight attempt.
//!
//! Worktrees live under `<worktrees_dir>/<session-short>/<task-key>-a<attempt>`
//! on branch `foreman/<session-short>/<task-key>-a<attempt>`, where the task
//! key is [`TaskId::workspace_key`]. A path is never reused by two attempts.
//! Accepted attempts are committed and keep their branch; every other
//! attempt's branch is deleted at teardown.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::core::TaskId;
use crate::git::GitOps;
use crate::Result;

pub const BRANCH_PREFIX: &str = "foreman";

/// A provisioned worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    pub branch: String,
}

/// Outcome of removing worktrees.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    /// Directories no checkpoint knew about.
    pub orphaned: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
        self.orphaned.extend(other.orphaned);
    }
}

pub struct WorkspaceManager {
    git: GitOps,
    root: PathBuf,
    namespace: String,
    /// Serializes ref and worktree-admin writes across attempts.
    git_lock: Mutex<()>,
}

impl WorkspaceManager {
    /// `worktrees_dir` is the global worktree directory; `namespace` is the
    /// session's short id.
    pub fn new(repo_path: &Path, worktrees_dir: &Path, namespace: &str) -> Result<Self> {
        Ok(Self {
            git: GitOps::new(repo_path)?,
            root: worktrees_dir.join(namespace),
            namespace: namespace.to_string(),
            git_lock: Mutex::new(()),
        })
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.git_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, task_id: &TaskId, attempt: u32) -> PathBuf {
        self.root.join(Self::folder_name(task_id, attempt))
    }

    pub fn branch_for(&self, task_id: &TaskId, attempt: u32) -> String {
        self.branch_for_folder(&Self::folder_name(task_id, attempt))
    }

    fn folder_name(task_id: &TaskId, attempt: u32) -> String {
        format!("{}-a{}", task_id.workspace_key(), attempt)
    }

    fn branch_for_folder(&self, folder: &str) -> String {
        format!("{}/{}/{}", BRANCH_PREFIX, self.namespace, folder)
    }

    /// Git's worktree admin names are shared by every session on the repo,
    /// so they carry the namespace too.
    fn admin_name(&self, folder: &str) -> String {
        format!("{}-{}-{}", BRANCH_PREFIX, self.namespace, folder)
    }

    /// Create the worktree for one attempt. Leftovers from an interrupted
    /// run at the same path or branch are cleared first.
    pub fn provision(&self, task_id: &TaskId, attempt: u32) -> Result<Workspace> {
        let path = self.path_for(task_id, attempt);
        let branch = self.branch_for(task_id, attempt);
        let _guard = self.serialize();

        if path.exists() {
            warn!(path = %path.display(), "stale worktree in the way, removing");
        }
        // Also clears a record whose directory is already gone.
        self.git.remove_worktree(&path)?;
        if self.git.branch_exists(&branch)? {
            self.git.delete_branch(&branch)?;
        }
        std::fs::create_dir_all(&self.root)?;
        let folder = Self::folder_name(task_id, attempt);
        self.git.create_worktree(&self.admin_name(&folder), &branch, &path)?;
        info!(task = %task_id, attempt, path = %path.display(), "worktree provisioned");
        Ok(Workspace { path, branch })
    }

    pub fn collect_diff(workspace: &Workspace) -> Result<String> {
        GitOps::diff_worktree(&workspace.path)
    }

    /// Commit the attempt's changes on its branch.
    pub fn commit(&self, workspace: &Workspace, message: &str) -> Result<Option<String>> {
        let _guard = self.serialize();
        GitOps::commit_all(&workspace.path, message)
    }

    /// Remove the worktree. The branch survives only if `keep_branch`.
    pub fn teardown(&self, workspace: &Workspace, keep_branch: bool) -> Result<()> {
        let _guard = self.serialize();
        self.git.remove_worktree(&workspace.path)?;
        if !keep_branch {
            self.git.delete_branch(&workspace.branch)?;
        }
        debug!(path = %workspace.path.display(), keep_branch, "worktree torn down");
        Ok(())
    }

    /// Remove worktrees by path, best effort. Failures are collected, not returned.
    pub fn reclaim<'a>(&self, paths: impl IntoIterator<Item = &'a PathBuf>) -> CleanupReport {
        let _guard = self.serialize();
        let mut report = CleanupReport::default();
        for path in paths {
            match self.git.remove_worktree(path) {
                Ok(()) => report.removed.push(path.clone()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to reclaim worktree");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                let _ = self.git.delete_branch(&self.branch_for_folder(name));
            }
        }
        if let Err(e) = self.git.prune_stale_worktrees() {
            warn!(error = %e, "failed to prune stale worktree records");
        }
        report
    }

    /// Directories under this session's root that are not in `known`.
    pub fn detect_orphans(&self, known: &BTreeSet<PathBuf>) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut orphans: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir() && !known.contains(p))
            .collect();
        orphans.sort();
        orphans
    }

    /// Reclaim `known` plus any orphans, then drop the session root if empty.
    ///
    /// Worktrees in `retained` were kept on purpose after their attempt
    /// finished. They are neither reclaimed nor counted as orphans, and
    /// their branches survive.
    pub fn reclaim_all(&self, known: &BTreeSet<PathBuf>, retained: &BTreeSet<PathBuf>) -> CleanupReport {
        let accounted: BTreeSet<PathBuf> = known.union(retained).cloned().collect();
        let orphans = self.detect_orphans(&accounted);
        if !orphans.is_empty() {
            info!(count = orphans.len(), "reclaiming orphaned worktrees");
        }
        let mut report = self.reclaim(
            known
                .iter()
                .filter(|p| p.exists() && !retained.contains(*p)),
        );
        report.merge(self.reclaim(orphans.iter()));
        report.orphaned = orphans;
        let _ = std::fs::remove_dir(&self.root);
        report
    }
}
