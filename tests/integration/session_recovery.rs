//! Crash recovery, resume and abort of sessions nobody is running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use foreman::core::{TaskId, TaskStatus, Tier};
use foreman::orchestration::Factory;
use foreman::session::{AbortOutcome, Session, WorkerHandle};
use foreman::{Error, SessionStatus};

use crate::fixtures::{capacity, test_config, test_task, ScriptedProvider, TestRepo, WorkerScript};

/// A session whose first task was mid-attempt when its orchestrator died,
/// with one orphaned directory under the session root. Returns the session
/// and the two paths that should be reclaimed.
fn crashed_session(repo: &TestRepo) -> (Session, std::path::PathBuf, std::path::PathBuf) {
    let store = repo.store();
    let mut session = repo.session(vec![test_task("T-1"), test_task("T-2")]);
    let id = TaskId::new("T-1");
    session.tasks[0].assigned_tier = Some(Tier::Balanced);
    session.tasks[0].start_attempt();

    let manager = session.workspaces().unwrap();
    let workspace = manager.provision(&id, 1).unwrap();
    session.register_worker(
        &id,
        WorkerHandle {
            tier: Tier::Balanced,
            attempt: 1,
            worktree: workspace.path.clone(),
            started_at: Utc::now(),
        },
    );
    let orphan = manager.root().join("stray-a9");
    std::fs::create_dir_all(&orphan).unwrap();

    let lock = store.start(&mut session).unwrap();
    drop(lock);
    (session, workspace.path, orphan)
}

#[test]
fn test_dead_session_is_marked_crashed() {
    let repo = TestRepo::new();
    let (session, _, _) = crashed_session(&repo);
    let store = repo.store();

    assert!(!store.is_live(session.id));
    assert_eq!(store.recover_crashed().unwrap(), vec![session.id]);
    assert_eq!(store.load(session.id).unwrap().status, SessionStatus::Crashed);

    // Nothing left to recover on a second pass.
    assert!(store.recover_crashed().unwrap().is_empty());
}

#[test]
fn test_live_session_is_not_recovered_or_resumed() {
    let repo = TestRepo::new();
    let store = repo.store();
    let mut session = repo.session(vec![test_task("T-1")]);
    let _lock = store.start(&mut session).unwrap();

    assert!(store.is_live(session.id));
    assert!(store.recover_crashed().unwrap().is_empty());
    assert!(matches!(store.resume(session.id), Err(Error::SessionLocked(_))));
}

#[tokio::test]
async fn test_resume_reclaims_requeues_and_runs_to_completion() {
    let repo = TestRepo::new();
    let (session, worktree, orphan) = crashed_session(&repo);
    let store = repo.store();
    store.recover_crashed().unwrap();

    let resumed = store.resume(session.id).unwrap();
    assert_eq!(resumed.requeued, vec![TaskId::new("T-1")]);
    assert!(!worktree.exists());
    assert!(!orphan.exists());
    assert_eq!(resumed.cleanup.orphaned, vec![orphan]);
    assert_eq!(resumed.session.status, SessionStatus::Active);
    assert!(resumed.session.active_tasks.is_empty());
    assert_eq!(resumed.session.tasks[0].status, TaskStatus::Pending);
    assert!(store.is_live(session.id));

    let config = test_config(capacity(1, 1, 1));
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));
    let factory = Factory::new(&config, provider.clone(), repo.store(), resumed.session, resumed.lock).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(60), factory.run())
        .await
        .expect("run timed out")
        .unwrap();

    assert_eq!(report.completed().count(), 2);
    // The interrupted attempt still counts.
    let first = report.tasks.iter().find(|t| t.task_id.as_str() == "T-1").unwrap();
    assert_eq!(first.attempts, 2);
    assert_eq!(provider.dispatches_for("T-1"), vec![Tier::Balanced]);

    let archived = store.load(session.id).unwrap();
    assert_eq!(archived.status, SessionStatus::Completed);
    assert!(matches!(store.resume(session.id), Err(Error::Validation(_))));
}

#[test]
fn test_abort_of_dead_session_cleans_up_and_archives() {
    let repo = TestRepo::new();
    let (session, worktree, orphan) = crashed_session(&repo);
    let store = repo.store();

    match store.abort(session.id).unwrap() {
        AbortOutcome::Aborted { requeued, cleanup } => {
            assert_eq!(requeued, vec![TaskId::new("T-1")]);
            assert!(cleanup.is_success());
        }
        AbortOutcome::Signalled => panic!("dead session was treated as live"),
    }
    assert!(!worktree.exists());
    assert!(!orphan.exists());

    let archived = store.load(session.id).unwrap();
    assert_eq!(archived.status, SessionStatus::Aborted);
    assert!(archived.active_tasks.is_empty());
    assert!(archived.tasks.iter().all(|t| !t.status.is_in_flight()));

    assert!(matches!(store.abort(session.id), Err(Error::Validation(_))));
    assert_eq!(store.find(&session.id.short()).unwrap().id, session.id);
}

#[test]
fn test_abort_of_dead_session_keeps_retained_worktrees() {
    let repo = TestRepo::new();
    let store = repo.store();
    let mut session = repo.session(vec![test_task("done"), test_task("T-2")]);
    let manager = session.workspaces().unwrap();
    let accepted = manager.provision(&TaskId::new("done"), 1).unwrap();
    std::fs::write(accepted.path.join("feature.txt"), "shipped\n").unwrap();
    assert!(manager.commit(&accepted, "accepted").unwrap().is_some());
    session.tasks[0].complete();
    session.retained_worktrees.insert(accepted.path.clone());
    drop(store.start(&mut session).unwrap());

    match store.abort(session.id).unwrap() {
        AbortOutcome::Aborted { cleanup, .. } => {
            assert!(cleanup.orphaned.is_empty());
            assert!(cleanup.removed.is_empty());
        }
        AbortOutcome::Signalled => panic!("dead session was treated as live"),
    }
    assert!(accepted.path.join("feature.txt").exists());
    assert_eq!(repo.foreman_branches(), vec![accepted.branch.clone()]);
}
