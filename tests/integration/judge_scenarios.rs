//! Judge verdicts deciding task outcomes inside a factory run.

use std::sync::Arc;
use std::time::Duration;

use foreman::core::{JudgeConfig, TaskStatus, Tier};
use foreman::notify::MemorySink;
use foreman::orchestration::{AttemptFailure, JudgeMode};

use crate::fixtures::{capacity, start_factory, test_config, test_task, ScriptedProvider, TestRepo, WorkerScript};

const RUN_LIMIT: Duration = Duration::from_secs(60);

const REJECT: &str = r#"{"passed": false, "verdict": "Unsafe input handling", "confidence": 0.9}"#;
const APPROVE: &str = r#"{"passed": true, "verdict": "Looks good", "confidence": 0.95}"#;

fn single_attempt_config() -> foreman::config::Config {
    let mut config = test_config(capacity(1, 1, 1));
    config.retry_limit = 1;
    config
}

#[tokio::test]
async fn test_no_judges_means_no_judge_calls() {
    let repo = TestRepo::new();
    let config = single_attempt_config();
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed));

    let harness = start_factory(&repo, &config, provider.clone(), vec![test_task("T-1")]);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(report.completed().count(), 1);
    assert_eq!(provider.judge_calls(), 0);
}

#[tokio::test]
async fn test_required_rejection_fails_the_task_and_notifies() {
    let repo = TestRepo::new();
    let mut config = single_attempt_config();
    config.notify_char_limit = 300;
    let long_reject = format!(
        r#"{{"passed": false, "verdict": "Unsafe", "reasoning": "{}", "confidence": 0.9}}"#,
        "the input is never validated ".repeat(80)
    );
    let provider = Arc::new(
        ScriptedProvider::new(WorkerScript::Succeed)
            .with_judge("Security Reviewer", &long_reject)
            .with_judge("QA", APPROVE),
    );
    let sink = Arc::new(MemorySink::new());
    let task = test_task("T-1").with_judges(vec![
        JudgeConfig::new("Security Reviewer"),
        JudgeConfig::new("QA"),
    ]);

    let mut harness = start_factory(&repo, &config, provider.clone(), vec![task]);
    harness.factory = harness.factory.with_sink(sink.clone());
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(report.tasks[0].status, TaskStatus::Failed);
    match &report.tasks[0].last_failure {
        Some(AttemptFailure::Judges { failed, .. }) => {
            assert_eq!(failed, &vec!["Security Reviewer".to_string()]);
        }
        other => panic!("expected a judge failure, got {:?}", other),
    }
    assert_eq!(provider.judge_calls(), 2);

    let messages = sink.messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].contains("judge(s) Security Reviewer"));
    assert!(messages[1].chars().count() <= 300);
    assert!(messages[1].contains("Security Reviewer"));
}

#[tokio::test]
async fn test_optional_rejection_does_not_block() {
    let repo = TestRepo::new();
    let config = single_attempt_config();
    let provider = Arc::new(
        ScriptedProvider::new(WorkerScript::Succeed)
            .with_judge("Style", REJECT)
            .with_judge("QA", APPROVE),
    );
    let task = test_task("T-1").with_judges(vec![JudgeConfig::new("QA"), JudgeConfig::new("Style").optional()]);

    let harness = start_factory(&repo, &config, provider.clone(), vec![task]);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(report.tasks[0].status, TaskStatus::Completed);
    assert!(report.tasks[0].commit.is_some());
}

#[tokio::test]
async fn test_fail_fast_stops_after_first_required_rejection() {
    let repo = TestRepo::new();
    let mut config = single_attempt_config();
    config.judge_mode = JudgeMode::SequentialFailFast;
    let provider = Arc::new(
        ScriptedProvider::new(WorkerScript::Succeed)
            .with_judge("Security Reviewer", REJECT)
            .with_judge("QA", APPROVE)
            .with_judge("Architect", APPROVE),
    );
    let task = test_task("T-1").with_judges(vec![
        JudgeConfig::new("Security Reviewer"),
        JudgeConfig::new("QA"),
        JudgeConfig::new("Architect"),
    ]);

    let harness = start_factory(&repo, &config, provider.clone(), vec![task]);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(report.tasks[0].status, TaskStatus::Failed);
    assert_eq!(provider.judge_calls(), 1);
}

#[tokio::test]
async fn test_default_judges_apply_when_task_names_none() {
    let repo = TestRepo::new();
    let mut config = single_attempt_config();
    config.default_judges = vec![JudgeConfig::new("QA").with_model(Tier::Fast)];
    let provider = Arc::new(ScriptedProvider::new(WorkerScript::Succeed).with_judge(
        "QA",
        "After reviewing the diff I would not approve this change; the tests are missing.",
    ));

    let harness = start_factory(&repo, &config, provider.clone(), vec![test_task("T-1")]);
    let report = tokio::time::timeout(RUN_LIMIT, harness.factory.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    // Free text with a negated approval is read as a rejection.
    assert_eq!(provider.judge_calls(), 1);
    assert_eq!(report.tasks[0].status, TaskStatus::Failed);
    assert!(report.tasks[0].commit.is_none());
}
