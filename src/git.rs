use std::path::{Path, PathBuf};

use git2::{DiffFormat, DiffOptions, ErrorCode, IndexAddOption, Repository, Signature};
use tracing::{debug, warn};

use crate::Result;

pub struct GitOps {
    repo_path: PathBuf,
}

fn prune_options() -> git2::WorktreePruneOptions {
    let mut opts = git2::WorktreePruneOptions::new();
    opts.valid(true).working_tree(true).locked(true);
    opts
}

/// `path` with symlinks resolved, as far as the filesystem allows. Git
/// records worktree paths in resolved form.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    match (path.parent().and_then(|p| p.canonicalize().ok()), path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create `branch` at HEAD and check it out in a new worktree at `path`.
    ///
    /// `admin_name` names git's record under `.git/worktrees`. Those names
    /// are shared by everything using the repository.
    pub fn create_worktree(&self, admin_name: &str, branch: &str, path: &Path) -> Result<()> {
        debug!(admin_name, branch, path = %path.display(), "creating worktree");
        let repo = self.repo()?;
        let head = repo.head()?.peel_to_commit()?;
        let reference = repo.branch(branch, &head, false)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(admin_name, path, Some(&opts))?;
        Ok(())
    }

    /// Admin name of the worktree registered at exactly `path`.
    fn registered_at(repo: &Repository, path: &Path) -> Result<Option<String>> {
        let wanted = resolve(path);
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if worktree.path() == path || resolve(worktree.path()) == wanted {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(None)
    }

    /// Remove the worktree at `path` and git's record of it.
    ///
    /// Only a record pointing at `path` itself is touched. That record has
    /// to go, otherwise the branch still counts as checked out.
    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), "removing worktree");
        let repo = self.repo()?;
        let registered = Self::registered_at(&repo, path)?;

        if let Some(name) = &registered {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(&mut prune_options())) {
                    warn!(worktree = %name, error = %e, "worktree prune failed");
                }
            }
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        if let Some(name) = registered {
            let admin_dir = repo.path().join("worktrees").join(&name);
            if admin_dir.exists() {
                debug!(dir = %admin_dir.display(), "removing worktree admin dir");
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Drop git's records of worktrees whose directories no longer exist.
    pub fn prune_stale_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() && wt.prune(Some(&mut prune_options())).is_ok() {
                    debug!(worktree = name, "pruned stale worktree reference");
                    pruned += 1;
                }
            }
        }
        Ok(pruned)
    }

    /// Paths of every linked worktree git knows about.
    pub fn list_worktrees(&self) -> Result<Vec<PathBuf>> {
        let repo = self.repo()?;
        let mut paths = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                paths.push(wt.path().to_path_buf());
            }
        }
        Ok(paths)
    }

    /// Unified diff of the worktree against its HEAD, untracked files included.
    pub fn diff_worktree(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut out = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin());
            }
            out.push_str(&String::from_utf8_lossy(line.content()));
            true
        })?;
        Ok(out)
    }

    /// Stage everything in the worktree and commit it on its branch.
    /// Returns `None` when there was nothing to commit.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
        let repo = Repository::open(worktree_path)?;
        if repo.statuses(None)?.is_empty() {
            return Ok(None);
        }
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("foreman", "foreman@localhost"))?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(commit = %id, path = %worktree_path.display(), "committed attempt");
        Ok(Some(id.to_string()))
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    /// Delete a local branch. Missing branches and delete failures are logged,
    /// not returned.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, git2::BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    warn!(branch, error = %e, "failed to delete branch");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(branch, "branch already gone");
            }
            Err(e) => warn!(branch, error = %e, "error looking up branch"),
        }
        Ok(())
    }

    /// Local branches under `prefix/`.
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let wanted = format!("{}/", prefix.trim_end_matches('/'));
        let mut names = Vec::new();
        for entry in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = entry?;
            if let Some(name) = branch.name()? {
                if name.starts_with(&wanted) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let ok = Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
                .status
                .success();
            assert!(ok, "git {:?} failed", args);
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-q", "-m", "init"]);
        dir
    }

    #[test]
    fn test_create_diff_commit_remove() {
        let repo = init_repo();
        let worktrees = TempDir::new().unwrap();
        let path = worktrees.path().join("t-1-a1");
        let git = GitOps::new(repo.path()).unwrap();

        git.create_worktree("test-t-1-a1", "foreman/test/t-1-a1", &path).unwrap();
        assert!(path.join("README.md").exists());
        assert!(git.branch_exists("foreman/test/t-1-a1").unwrap());

        std::fs::write(path.join("README.md"), "hello\nworld\n").unwrap();
        std::fs::write(path.join("new.txt"), "fresh\n").unwrap();
        let diff = GitOps::diff_worktree(&path).unwrap();
        assert!(diff.contains("+world"));
        assert!(diff.contains("+fresh"));

        assert!(GitOps::commit_all(&path, "attempt").unwrap().is_some());
        assert!(GitOps::commit_all(&path, "again").unwrap().is_none());

        git.remove_worktree(&path).unwrap();
        assert!(!path.exists());
        assert!(git.list_worktrees().unwrap().is_empty());
        assert_eq!(
            git.branches_with_prefix("foreman").unwrap(),
            vec!["foreman/test/t-1-a1".to_string()]
        );

        git.delete_branch("foreman/test/t-1-a1").unwrap();
        assert!(!git.branch_exists("foreman/test/t-1-a1").unwrap());
    }

    #[test]
    fn test_prune_stale_worktrees() {
        let repo = init_repo();
        let worktrees = TempDir::new().unwrap();
        let path = worktrees.path().join("gone");
        let git = GitOps::new(repo.path()).unwrap();
        git.create_worktree("gone", "foreman/gone", &path).unwrap();
        std::fs::remove_dir_all(&path).unwrap();
        assert_eq!(git.prune_stale_worktrees().unwrap(), 1);
        assert!(git.list_worktrees().unwrap().is_empty());
    }

    #[test]
    fn test_remove_leaves_same_folder_name_elsewhere_alone() {
        let repo = init_repo();
        let worktrees = TempDir::new().unwrap();
        let first = worktrees.path().join("s1").join("t-1-a1");
        let second = worktrees.path().join("s2").join("t-1-a1");
        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::create_dir_all(second.parent().unwrap()).unwrap();
        let git = GitOps::new(repo.path()).unwrap();
        git.create_worktree("s1-t-1-a1", "foreman/s1/t-1-a1", &first).unwrap();
        git.create_worktree("s2-t-1-a1", "foreman/s2/t-1-a1", &second).unwrap();

        git.remove_worktree(&second).unwrap();
        assert!(first.join("README.md").exists());
        assert!(repo.path().join(".git/worktrees/s1-t-1-a1").exists());
        assert!(!repo.path().join(".git/worktrees/s2-t-1-a1").exists());
        assert_eq!(git.list_worktrees().unwrap().len(), 1);

        // Never checked out: nothing registered, nothing touched.
        git.remove_worktree(&worktrees.path().join("s3").join("t-1-a1")).unwrap();
        assert!(first.exists());
    }

    #[test]
    fn test_delete_missing_branch_is_ok() {
        let repo = init_repo();
        let git = GitOps::new(repo.path()).unwrap();
        assert!(git.delete_branch("nope").is_ok());
    }
}
