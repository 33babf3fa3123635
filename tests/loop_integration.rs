//! End-to-end loop scenarios against mock collaborators.

use ci_autorepair::ci::RunStatus;
use ci_autorepair::r#loop::retry::RetryPolicy;
use ci_autorepair::testing::fixtures;
use ci_autorepair::{
    ErrorCategory, ErrorClassifier, EventLog, EventOutcome, LoopCoordinator, LoopCoordinatorConfig,
    MockCommandRunner, MockGitOperations, MockStatusSource, ProjectConfig, RepairExecutor, Run,
    StateStore, Termination,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> LoopCoordinatorConfig {
    LoopCoordinatorConfig::new()
        .with_poll_interval(Duration::ZERO)
        .with_verify_delay(Duration::ZERO)
        .with_run_polling(Duration::ZERO, Duration::from_secs(5))
        .with_fetch_retry(
            RetryPolicy::new(2).with_delays(Duration::from_millis(1), Duration::from_millis(1)),
        )
}

fn coordinator(
    config: LoopCoordinatorConfig,
    project: &ProjectConfig,
    source: Arc<MockStatusSource>,
    git: Arc<MockGitOperations>,
    runner: Arc<MockCommandRunner>,
    state_dir: &std::path::Path,
) -> LoopCoordinator {
    let executor = RepairExecutor::new(source.clone(), git, runner);
    LoopCoordinator::new(
        config,
        source,
        project.classifier().unwrap(),
        project.strategies(),
        executor,
        StateStore::new(state_dir),
    )
}

#[tokio::test]
async fn test_mixed_session_reaches_clean_threshold() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join(".autorepair");

    let lint_failure = Run::new("2", RunStatus::Failed)
        .with_failed_step("Lint")
        .with_log("✖ 3 problems (3 errors, 0 warnings)");

    let source = Arc::new(
        MockStatusSource::new()
            .then_run(fixtures::success_run("1"))
            .then_run(lint_failure)
            .then_run(fixtures::success_run("3"))
            .then_run(fixtures::success_run("4"))
            .then_run(fixtures::success_run("5")),
    );
    let git = Arc::new(MockGitOperations::new().with_modified_files(vec!["src/App.vue".into()]));
    let runner = Arc::new(MockCommandRunner::new());

    let summary = coordinator(
        fast_config().with_max_iterations(10).with_clean_threshold(3),
        &ProjectConfig::default(),
        source.clone(),
        git.clone(),
        runner.clone(),
        &state_dir,
    )
    .run()
    .await
    .unwrap();

    // 1 clean, 2 repaired (verified by run 3), 4 clean, 5 clean.
    assert_eq!(summary.termination, Termination::CleanThreshold);
    assert_eq!(summary.loop_count, 4);
    assert_eq!(summary.total_errors_fixed, 1);
    assert_eq!(summary.consecutive_clean_count, 3);
    assert_eq!(git.push_count(), 1);
    assert_eq!(runner.calls(), vec!["npm run lint -- --fix".to_string()]);

    let outcomes: Vec<EventOutcome> = EventLog::new(&state_dir)
        .read_all()
        .unwrap()
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![
            EventOutcome::Clean,
            EventOutcome::Repaired,
            EventOutcome::Clean,
            EventOutcome::Clean,
            EventOutcome::Done,
        ]
    );
}

#[tokio::test]
async fn test_state_file_is_readable_by_dashboards() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join(".autorepair");
    // Every rerun produces a newer run that fails the same way.
    let source = Arc::new(
        (9..=13).fold(MockStatusSource::new(), |source, id| {
            source.then_run(fixtures::network_failure_run(&id.to_string()))
        }),
    );
    let project: ProjectConfig =
        serde_json::from_str(r#"{ "strategies": { "network": { "retryBackoffSecs": 0 } } }"#)
            .unwrap();

    coordinator(
        fast_config().with_max_iterations(2),
        &project,
        source.clone(),
        Arc::new(MockGitOperations::new()),
        Arc::new(MockCommandRunner::new()),
        &state_dir,
    )
    .run()
    .await
    .unwrap();

    let raw = std::fs::read_to_string(state_dir.join("state.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["loop_count"], 2);
    assert_eq!(value["consecutive_clean_count"], 0);
    assert!(value["last_scan"].is_string());
    assert_eq!(value["active_repairs"], serde_json::json!({}));
    assert_eq!(value["phase"], "done");
    // Network gets 1 + 3 attempts per session, all spent in the first iteration.
    assert_eq!(value["retries_by_category"]["network"], 4);
    assert_eq!(source.rerun_count(), 4);
}

#[tokio::test]
async fn test_strategy_override_changes_repair_commands() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join(".autorepair");
    let project: ProjectConfig = serde_json::from_str(
        r#"{
            "strategies": {
                "dependency": {
                    "steps": [{ "type": "command", "program": "pnpm", "args": ["install", "--fix-lockfile"] }],
                    "maxRetries": 0
                }
            }
        }"#,
    )
    .unwrap();

    let source = Arc::new(
        MockStatusSource::new()
            .then_run(fixtures::dependency_failure_run("1"))
            .then_run(fixtures::success_run("2")),
    );
    let runner = Arc::new(MockCommandRunner::new());

    let summary = coordinator(
        fast_config().with_clean_threshold(1),
        &project,
        source,
        Arc::new(MockGitOperations::new()),
        runner.clone(),
        &state_dir,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.total_errors_fixed, 1);
    assert_eq!(
        runner.calls(),
        vec!["pnpm install --fix-lockfile".to_string()]
    );
}

#[tokio::test]
async fn test_permission_failure_is_never_escalated_across_iterations() {
    let temp = TempDir::new().unwrap();
    let state_dir = temp.path().join(".autorepair");
    let source = Arc::new(MockStatusSource::new().then_run(fixtures::permission_denied_run("7")));
    let git = Arc::new(
        MockGitOperations::new().with_modified_files(vec![".github/workflows/ci.yml".into()]),
    );
    let runner = Arc::new(MockCommandRunner::new());

    let summary = coordinator(
        fast_config().with_max_iterations(3),
        &ProjectConfig::default(),
        source.clone(),
        git.clone(),
        runner.clone(),
        &state_dir,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(summary.termination, Termination::MaxIterations);
    assert_eq!(summary.total_errors_fixed, 0);
    assert_eq!(git.commit_count(), 0);
    assert_eq!(git.push_count(), 0);
    assert_eq!(source.rerun_count(), 0);
    assert!(runner.calls().is_empty());

    let events = EventLog::new(&state_dir).read_all().unwrap();
    assert_eq!(events.len(), 4);
    assert!(events[..3]
        .iter()
        .all(|e| e.outcome == EventOutcome::FailedPermanent
            && e.category == Some(ErrorCategory::Unknown)));
}

#[test]
fn test_classifier_scenario_exit_128_push() {
    let record = ErrorClassifier::with_defaults()
        .classify(&fixtures::permission_denied_run("1"))
        .unwrap();
    assert_eq!(record.category, ErrorCategory::Permission);
}
