//! Full factory runs against a real repository.

use std::sync::Arc;
use std::time::Duration;

use foreman::core::{Task, TaskStatus, Tier};
use foreman::notify::MemorySink;
use foreman::orchestration::{AttemptFailure, Decision, FactoryEvent, GateConfig, GateKind};
use foreman::session::AbortOutcome;
use foreman::SessionStatus;

use crate::fixtures::{capacity, drain, start_factory, test_config, test_task, ScriptedProvider, TestRepo, WorkerScript};

const RUN_LIMIT: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_every_task_completes_and_is_committed() {
    let repo = TestRepo::new();
    let config = test_config(capacity(2, 2, 1));
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));
    let tasks = vec![test_task("T-1"), test_task("T-2"), test_task("T-3")];

    let mut harness = start_factory(&repo, &config, provider.clone(), tasks);
    let session = harness.factory.session().clone();
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert!(!report.aborted);
    assert_eq!(report.completed().count(), 3);
    assert!(report.progress.is_finished());
    for task in &report.tasks {
        assert_eq!(task.attempts, 1, "{} took more than one attempt", task.task_id);
        assert!(task.commit.is_some(), "{} has no commit", task.task_id);
        assert_eq!(task.decision, Some(Decision::Accepted));
    }

    // Accepted branches stay, worktrees do not.
    assert_eq!(repo.foreman_branches().len(), 3);
    assert!(repo.leftover_worktrees(&session).is_empty());

    let archived = repo.store().load(session.id).unwrap();
    assert_eq!(archived.status, SessionStatus::Completed);
    assert!(archived.active_tasks.is_empty());

    let events = drain(&mut harness.events);
    let completed = events
        .iter()
        .filter(|e| matches!(e, FactoryEvent::TaskCompleted { .. }))
        .count();
    assert_eq!(completed, 3);
    assert_eq!(events.last(), Some(&FactoryEvent::AllTasksComplete));
}

#[tokio::test]
async fn test_gate_failure_escalates_until_exhausted() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(1, 1, 1));
    config.retry_limit = 3;
    config.escalate_on_retry = true;
    config.gates = vec![GateConfig::new("test", GateKind::Test, "exit 1")];
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));
    let sink = Arc::new(MemorySink::new());
    let task = test_task("T-1").with_tier_override(Tier::Fast);

    let mut harness = start_factory(&repo, &config, provider.clone(), vec![task]);
    harness.factory = harness.factory.with_sink(sink.clone());
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    // Exactly retry_limit dispatches, never moving down a tier.
    assert_eq!(
        provider.dispatches_for("T-1"),
        vec![Tier::Fast, Tier::Balanced, Tier::Powerful]
    );

    let task = &report.tasks[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert_eq!(task.final_tier, Some(Tier::Powerful));
    assert_eq!(task.decision, Some(Decision::Exhausted));
    assert!(matches!(
        task.last_failure,
        Some(AttemptFailure::Gate { ref gate, .. }) if gate == "test"
    ));

    let events = drain(&mut harness.events);
    let retries: Vec<Decision> = events
        .iter()
        .filter_map(|e| match e {
            FactoryEvent::TaskRetrying { decision, .. } => Some(*decision),
            _ => None,
        })
        .collect();
    assert_eq!(
        retries,
        vec![
            Decision::RetryEscalated { to: Tier::Balanced },
            Decision::RetryEscalated { to: Tier::Powerful },
        ]
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, FactoryEvent::TaskFailed { task_id, .. } if task_id.as_str() == "T-1")));

    let messages = sink.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Task 'T-1' failed after 3 attempt(s)"));
    assert!(messages[0].contains("gate 'test'"));

    // Rejected attempts leave no branches behind.
    assert!(repo.foreman_branches().is_empty());
}

#[tokio::test]
async fn test_retries_stay_on_tier_without_escalation() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(1, 1, 1));
    config.retry_limit = 2;
    config.escalate_on_retry = false;
    config.auto_route = false;
    config.default_tier = Tier::Balanced;
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Crash));

    let harness = start_factory(&repo, &config, provider.clone(), vec![test_task("T-1")]);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(provider.dispatches_for("T-1"), vec![Tier::Balanced, Tier::Balanced]);
    assert_eq!(report.failed().count(), 1);
    assert!(matches!(
        report.tasks[0].last_failure,
        Some(AttemptFailure::Execution { .. })
    ));
}

#[tokio::test]
async fn test_unstaffed_tier_routes_to_staffed_one() {
    let repo = TestRepo::new();
    let config = test_config(capacity(0, 1, 0));
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));
    let tasks = vec![
        test_task("T-fast").with_tier_override(Tier::Fast),
        test_task("T-big").with_tier_override(Tier::Powerful),
    ];

    let harness = start_factory(&repo, &config, provider.clone(), tasks);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(report.completed().count(), 2);
    assert!(provider.dispatches().iter().all(|(_, tier)| *tier == Tier::Balanced));
}

#[tokio::test]
async fn test_unroutable_task_is_reported_once_and_left_pending() {
    let repo = TestRepo::new();
    let config = test_config(capacity(1, 1, 1));
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));
    let tasks = vec![Task::new("T-empty", "   "), test_task("T-ok")];

    let mut harness = start_factory(&repo, &config, provider.clone(), tasks);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    let unroutable: Vec<_> = drain(&mut harness.events)
        .into_iter()
        .filter(|e| matches!(e, FactoryEvent::TaskUnroutable { .. }))
        .collect();
    assert_eq!(unroutable.len(), 1);

    let empty = report.tasks.iter().find(|t| t.task_id.as_str() == "T-empty").unwrap();
    assert_eq!(empty.status, TaskStatus::Pending);
    assert_eq!(empty.attempts, 0);
    assert!(provider.dispatches_for("T-empty").is_empty());
    assert_eq!(report.completed().count(), 1);
}

#[tokio::test]
async fn test_cancel_requeues_in_flight_and_reclaims_worktrees() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(2, 0, 0));
    config.auto_route = false;
    config.default_tier = Tier::Fast;
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Hang));
    let tasks = vec![test_task("T-1"), test_task("T-2"), test_task("T-3")];

    let harness = start_factory(&repo, &config, provider.clone(), tasks);
    let session = harness.factory.session().clone();
    let cancel = harness.factory.cancel_token();
    let mut events = harness.events;

    let canceller = async move {
        let mut dispatched = 0;
        while let Some(event) = events.recv().await {
            if matches!(event, FactoryEvent::TaskDispatched { .. }) {
                dispatched += 1;
                if dispatched == 2 {
                    break;
                }
            }
        }
        // Let both attempts reach the agent.
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        events
    };
    let (report, mut events) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(harness.factory.run(), canceller)
    })
    .await
    .expect("run timed out");
    let report = report.expect("run failed");

    assert!(report.aborted);
    assert_eq!(report.progress.in_flight(), 0);
    assert!(report
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Pending));
    assert!(repo.leftover_worktrees(&session).is_empty());

    let aborted = drain(&mut events)
        .into_iter()
        .find_map(|e| match e {
            FactoryEvent::Aborted { requeued } => Some(requeued),
            _ => None,
        })
        .expect("no abort event");
    assert_eq!(aborted.len(), 2);

    let archived = repo.store().load(session.id).unwrap();
    assert_eq!(archived.status, SessionStatus::Aborted);
    assert!(archived.active_tasks.is_empty());
}

#[tokio::test]
async fn test_abort_with_cleanup_off_keeps_accepted_work() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(2, 0, 0));
    config.auto_route = false;
    config.default_tier = Tier::Fast;
    config.cleanup_worktrees = false;
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed).with_worker_for("T-2", WorkerScript::Hang));
    let tasks = vec![test_task("T-1"), test_task("T-2")];

    let harness = start_factory(&repo, &config, provider.clone(), tasks);
    let session = harness.factory.session().clone();
    let cancel = harness.factory.cancel_token();
    let mut events = harness.events;

    let canceller = async move {
        while let Some(event) = events.recv().await {
            if matches!(event, FactoryEvent::TaskCompleted { .. }) {
                break;
            }
        }
        cancel.cancel();
    };
    let (report, ()) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(harness.factory.run(), canceller)
    })
    .await
    .expect("run timed out");
    let report = report.expect("run failed");
    assert!(report.aborted);

    let archived = repo.store().load(session.id).unwrap();
    assert_eq!(archived.status, SessionStatus::Aborted);
    assert_eq!(archived.retained_worktrees.len(), 1);
    let kept = archived.retained_worktrees.iter().next().unwrap();
    assert!(kept.join("t-1.txt").exists());

    // The accepted branch survives the abort; the interrupted one does not.
    assert_eq!(repo.leftover_worktrees(&session), vec![kept.clone()]);
    let branches = repo.foreman_branches();
    assert_eq!(branches.len(), 1);
    assert!(branches[0].ends_with(kept.file_name().unwrap().to_str().unwrap()));
}

#[tokio::test]
async fn test_abort_marker_stops_live_run() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(1, 0, 0));
    config.auto_route = false;
    config.default_tier = Tier::Fast;
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Hang));

    let harness = start_factory(&repo, &config, provider.clone(), vec![test_task("T-1")]);
    let session = harness.factory.session().clone();
    let mut events = harness.events;
    let outside = repo.store();

    let aborter = async move {
        while let Some(event) = events.recv().await {
            if matches!(event, FactoryEvent::TaskDispatched { .. }) {
                break;
            }
        }
        outside.abort(session.id).expect("abort failed")
    };
    let (report, outcome) = tokio::time::timeout(RUN_LIMIT, async {
        tokio::join!(harness.factory.run(), aborter)
    })
    .await
    .expect("run timed out");

    assert!(matches!(outcome, AbortOutcome::Signalled));
    let report = report.expect("run failed");
    assert!(report.aborted);
    assert_eq!(report.tasks[0].status, TaskStatus::Pending);

    let store = repo.store();
    assert_eq!(store.load(session.id).unwrap().status, SessionStatus::Aborted);
    assert!(!store.abort_requested(session.id));
}

#[tokio::test]
async fn test_planner_adds_and_retires_waiting_work() {
    let repo = TestRepo::new();
    let mut config = test_config(capacity(1, 0, 0));
    config.auto_route = false;
    config.default_tier = Tier::Fast;
    config.planner.enabled = true;
    config.planner.interval_secs = 1;
    let provider = Arc::new(
        ScriptedProvider::new(WorkerScript::Slow(Duration::from_millis(1500))).with_plans(&[
            r#"{"add": [{"id": "T-docs", "description": "Document T-1"}], "retire": ["T-gone"]}"#,
        ]),
    );
    // One slot: T-gone is still waiting when the first planner round lands.
    let tasks = vec![test_task("T-1"), test_task("T-gone")];

    let mut harness = start_factory(&repo, &config, provider.clone(), tasks);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert!(provider.planner_calls() >= 1);
    assert!(report.completed().any(|t| t.task_id.as_str() == "T-docs"));
    assert!(report.tasks.iter().all(|t| t.task_id.as_str() != "T-gone"));
    assert!(provider.dispatches_for("T-gone").is_empty());

    let plan = drain(&mut harness.events).into_iter().find_map(|e| match e {
        FactoryEvent::PlanApplied { added, retired, .. } => Some((added, retired)),
        _ => None,
    });
    assert_eq!(plan, Some((1, 1)));
}
