mod common;

use std::sync::Arc;

use common::{builder, fast_config, single, transitions, ScriptedProvider};
use conductor_core::{
    BudgetTier, DecisionKind, FailureKind, JobState, PiiLevel, TaskGraph, TaskSpec, TaskState,
    TaskType,
};
use conductor_runtime::{BreakerState, Command, MemorySink, ProviderError, RuntimeError};

const POLICY: &str = r#"
version: "runner-tests"
rules:
  - id: generate-local
    match: { task: generate }
    choose: { providerOrder: [local], model: local-small, maxCostUsd: 0.5, latencyP95Ms: 2000 }
  - id: render-local
    match: { task: render }
    choose: { providerOrder: [renderer], model: canvas, maxCostUsd: 0.5, latencyP95Ms: 2000 }
"#;

fn network() -> ProviderError {
    ProviderError::Network("connection refused".into())
}

#[tokio::test(start_paused = true)]
async fn test_attempts_exhausted_after_max_attempts() {
    let local = ScriptedProvider::new("local")
        .then_err(network())
        .then_err(network())
        .then_err(network())
        .arc();
    let runner = builder(POLICY)
        .provider("local", local.clone())
        .build()
        .unwrap();

    let report = runner
        .run(Command::new(
            single("draft", TaskType::Generate),
            BudgetTier::Standard,
            PiiLevel::None,
        ))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Failed);
    let task = report.task("draft").unwrap();
    assert_eq!(task.state, TaskState::FailedFatal);
    assert_eq!(task.attempt, 3);
    assert_eq!(
        task.failure.as_ref().unwrap().kind,
        FailureKind::AttemptsExhausted
    );
    assert_eq!(local.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_optional_failure_yields_partial_completion() {
    let local = ScriptedProvider::new("local").then_ok("summary").arc();
    // Default context policy forbids PII in responses
    let renderer = ScriptedProvider::new("renderer")
        .then_ok("rendered for alice@example.com")
        .arc();
    let runner = builder(POLICY)
        .provider("local", local)
        .provider("renderer", renderer.clone())
        .build()
        .unwrap();

    let graph = TaskGraph::new(vec![
        TaskSpec::new("summary", TaskType::Generate),
        TaskSpec::new("chart", TaskType::Render)
            .depends_on(["summary"])
            .optional(),
        TaskSpec::new("thumbnail", TaskType::Render)
            .depends_on(["chart"])
            .optional(),
    ]);
    let report = runner
        .run(Command::new(graph, BudgetTier::Standard, PiiLevel::None))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::PartiallyCompleted);
    assert_eq!(report.task("summary").unwrap().state, TaskState::Succeeded);

    let chart = report.task("chart").unwrap();
    assert_eq!(chart.state, TaskState::FailedFatal);
    assert_eq!(chart.failure.as_ref().unwrap().kind, FailureKind::PolicyViolation);
    assert_eq!(chart.attempt, 1);

    let thumbnail = report.task("thumbnail").unwrap();
    assert_eq!(thumbnail.state, TaskState::FailedFatal);
    assert_eq!(
        thumbnail.failure.as_ref().unwrap().kind,
        FailureKind::DependencyFailed
    );
    assert_eq!(transitions(&report.trail("thumbnail")), vec![TaskState::FailedFatal]);
    assert_eq!(renderer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_required_failure_blocks_dependents_and_fails_job() {
    let local = ScriptedProvider::new("local").arc();
    let renderer = ScriptedProvider::new("renderer")
        .then_ok("token sk-abcdefghijklmnopqrstuvwx1234")
        .arc();
    let runner = builder(POLICY)
        .provider("local", local.clone())
        .provider("renderer", renderer)
        .build()
        .unwrap();

    let graph = TaskGraph::new(vec![
        TaskSpec::new("chart", TaskType::Render),
        TaskSpec::new("caption", TaskType::Generate).depends_on(["chart"]),
    ]);
    let report = runner
        .run(Command::new(graph, BudgetTier::Standard, PiiLevel::None))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Failed);
    let caption = report.task("caption").unwrap();
    assert_eq!(caption.state, TaskState::FailedFatal);
    assert_eq!(
        caption.failure.as_ref().unwrap().kind,
        FailureKind::DependencyFailed
    );
    // A blocked task is never routed
    assert!(caption.route.is_none());
    assert_eq!(local.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_tasks_run_concurrently() {
    let local = ScriptedProvider::new("local")
        .delay(std::time::Duration::from_secs(1))
        .arc();
    let runner = builder(POLICY)
        .provider("local", local.clone())
        .build()
        .unwrap();

    let graph = TaskGraph::new(vec![
        TaskSpec::new("a", TaskType::Generate),
        TaskSpec::new("b", TaskType::Generate),
        TaskSpec::new("c", TaskType::Generate),
    ]);
    let started = tokio::time::Instant::now();
    let report = runner
        .run(Command::new(graph, BudgetTier::Standard, PiiLevel::None))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Completed);
    assert_eq!(local.calls(), 3);
    // Standard allows four workers, so the three calls overlap
    assert!(started.elapsed() < std::time::Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_report_matches_persisted_state() {
    let sink = Arc::new(MemorySink::new());
    let local = ScriptedProvider::new("local")
        .then_err(network())
        .then_ok("final")
        .arc();
    let runner = builder(POLICY)
        .provider("local", local)
        .sink(sink.clone())
        .build()
        .unwrap();

    let report = runner
        .run(
            Command::new(
                single("draft", TaskType::Generate),
                BudgetTier::Standard,
                PiiLevel::None,
            )
            .with_job_id("job-persisted")
            .with_correlation_id("corr-1"),
        )
        .await
        .unwrap();

    assert_eq!(report.job_id, "job-persisted");
    assert_eq!(report.correlation_id, "corr-1");
    assert!(!report.persistence_degraded);

    let jobs = sink.jobs();
    let last = jobs.last().unwrap();
    assert_eq!(last.id, "job-persisted");
    assert_eq!(last.state, JobState::Completed);

    let persisted = sink.decisions();
    assert_eq!(persisted, report.decisions);
    assert!(persisted.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(persisted.iter().all(|r| r.correlation_id == "corr-1"));

    let last_task = sink
        .tasks()
        .into_iter()
        .filter(|t| t.id == "draft")
        .last()
        .unwrap();
    assert_eq!(last_task.state, TaskState::Succeeded);
    assert_eq!(last_task.attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistence_overflow_fails_job() {
    let sink = Arc::new(MemorySink::new());
    sink.set_unavailable(true);

    let mut config = fast_config();
    config.persistence.buffer_capacity = 1;

    let local = ScriptedProvider::new("local").arc();
    let runner = builder(POLICY)
        .config(config)
        .provider("local", local)
        .sink(sink.clone())
        .build()
        .unwrap();

    let report = runner
        .run(Command::new(
            single("draft", TaskType::Generate),
            BudgetTier::Standard,
            PiiLevel::None,
        ))
        .await
        .unwrap();

    assert_eq!(report.state, JobState::Failed);
    assert!(report.persistence_degraded);
    let task = report.task("draft").unwrap();
    assert_eq!(task.state, TaskState::FailedFatal);
    assert_eq!(task.failure.as_ref().unwrap().kind, FailureKind::Persistence);
    assert!(runner.metrics().snapshot().persistence_dropped > 0);
    assert!(sink.decisions().is_empty());

    // The in-flight call was wound down, not abandoned
    let standard = runner.cost_guard().tier_ledger(BudgetTier::Standard);
    assert_eq!(standard.reserved_usd, 0.0);
    assert_eq!(
        runner.cost_guard().breaker_state(BudgetTier::Standard),
        BreakerState::Closed
    );
    assert_eq!(runner.decision_log().job_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_finished_jobs_leave_nothing_in_the_log() {
    let local = ScriptedProvider::new("local").arc();
    let runner = builder(POLICY).provider("local", local).build().unwrap();

    for job in ["job-a", "job-b"] {
        let report = runner
            .run(
                Command::new(
                    single("draft", TaskType::Generate),
                    BudgetTier::Standard,
                    PiiLevel::None,
                )
                .with_job_id(job),
            )
            .await
            .unwrap();

        assert_eq!(report.state, JobState::Completed);
        assert!(!report.decisions.is_empty());
        assert!(report.decisions.iter().all(|r| r.job_id == job));
        assert!(runner.decision_log().records_for(job).is_empty());
        assert_eq!(runner.decision_log().job_count(), 0);
        assert!(runner.cost_guard().job_ledger(job).is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_denies_further_calls() {
    let mut config = fast_config();
    config.breaker.failure_threshold = 2;

    let local = ScriptedProvider::new("local")
        .then_err(network())
        .then_err(network())
        .then_err(network())
        .arc();
    let runner = builder(POLICY)
        .config(config)
        .provider("local", local.clone())
        .build()
        .unwrap();

    let report = runner
        .run(Command::new(
            single("draft", TaskType::Generate),
            BudgetTier::Standard,
            PiiLevel::None,
        ))
        .await
        .unwrap();

    assert_eq!(local.calls(), 2);
    assert_eq!(
        runner.cost_guard().breaker_state(BudgetTier::Standard),
        BreakerState::Open
    );

    let task = report.task("draft").unwrap();
    assert_eq!(
        task.failure.as_ref().unwrap().kind,
        FailureKind::AttemptsExhausted
    );
    let denied_on_third = report.trail("draft").iter().any(|r| {
        r.attempt == 3 && matches!(r.kind, DecisionKind::Admission { admitted: false, .. })
    });
    assert!(denied_on_third);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_job_is_rejected_while_running() {
    let local = ScriptedProvider::new("local")
        .delay(std::time::Duration::from_secs(5))
        .arc();
    let runner = builder(POLICY).provider("local", local).build().unwrap();

    let command = || {
        Command::new(
            single("draft", TaskType::Generate),
            BudgetTier::Standard,
            PiiLevel::None,
        )
        .with_job_id("job-1")
    };

    let (_, handle) = runner.submit(command()).unwrap();
    let err = runner.submit(command()).unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateJob(id) if id == "job-1"));

    handle.wait().await.unwrap();
    // The id is free again once the first run is over
    let (_, again) = runner.submit(command()).unwrap();
    again.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_invalid_graph_is_rejected_at_submit() {
    let runner = builder(POLICY)
        .provider("local", ScriptedProvider::new("local").arc())
        .build()
        .unwrap();

    let graph = TaskGraph::new(vec![
        TaskSpec::new("a", TaskType::Generate).depends_on(["b"]),
        TaskSpec::new("b", TaskType::Generate).depends_on(["a"]),
    ]);
    let err = runner
        .submit(Command::new(graph, BudgetTier::Standard, PiiLevel::None))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Graph(_)));
}
