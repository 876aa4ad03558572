// tests/retry_transient.rs

//! Transient failure classification and automatic retry.

mod common;

use common::builders::{refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeOutcome};

use serde_json::json;

use martian::jobmgr::RetryConfig;
use martian::syntax::Callables;
use martian::types::MetadataState;

fn callables() -> Callables {
    Callables::new([
        StageBuilder::new("S")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("S").bind("x", "int", self_ref("x")).build())
            .ret("y", "int", refr("S", "y"))
            .build(),
    ])
}

#[tokio::test]
async fn signal_failure_is_retried_and_succeeds() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    // First attempt dies to a signal; the registered handler then succeeds.
    jobs.inject(
        "ID.ps1.P.S",
        "main",
        FakeOutcome::Errors("signal: killed".to_string()),
    );
    jobs.on_stage("ID.ps1.P.S", |_| {
        FakeOutcome::Success([("y".to_string(), json!(2))].into_iter().collect())
    });

    let mut rt = fake_runtime(common::test_runtime_options(), jobs.clone());
    rt.retry = RetryConfig::new(1, &["^signal: "]);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    // Two chunk dispatches: the failed attempt and the retry.
    let mains = jobs
        .dispatched()
        .into_iter()
        .filter(|(_, s)| s == "main")
        .count();
    assert_eq!(mains, 2);

    // The retry consumed exactly one unit of budget, recorded in perf.
    let s_id = ps.graph().find("ID.ps1.P.S").unwrap();
    assert_eq!(ps.graph().node(s_id).restarts, 1);
    let perf: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("ps1").join("_perf")).unwrap(),
    )
    .unwrap();
    let stage_perf = perf
        .as_array()
        .unwrap()
        .iter()
        .find(|n| n["fqname"] == "ID.ps1.P.S")
        .unwrap();
    assert_eq!(stage_perf["forks"][0]["num_restarts"], json!(1));
}

#[tokio::test]
async fn non_matching_error_is_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.S", |_| {
        FakeOutcome::Errors("stage panicked: bad input".to_string())
    });

    let mut rt = fake_runtime(common::test_runtime_options(), jobs.clone());
    rt.retry = RetryConfig::new(3, &["^signal: "]);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Failed);
    assert_eq!(result.exit_code(), 2);
    match result {
        martian::PipestanceFinal::Failed { error: Some(e) } => {
            assert!(e.log.contains("stage panicked"));
            // Compiled stages carry no summarizable log layout; the summary
            // stays "<none>" and the full log is attached instead.
            assert_eq!(e.summary, "<none>");
        }
        other => panic!("expected a fatal error, got {other:?}"),
    }

    // No retry was attempted despite remaining budget.
    let mains = jobs
        .dispatched()
        .into_iter()
        .filter(|(_, s)| s == "main")
        .count();
    assert_eq!(mains, 1);
}

#[tokio::test]
async fn exhausted_budget_is_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    // Every attempt dies to a signal.
    jobs.on_stage("ID.ps1.P.S", |_| {
        FakeOutcome::Errors("signal: terminated".to_string())
    });

    let mut rt = fake_runtime(common::test_runtime_options(), jobs.clone());
    rt.retry = RetryConfig::new(2, &["^signal: "]);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Failed);

    // Initial attempt plus two retries.
    let mains = jobs
        .dispatched()
        .into_iter()
        .filter(|(_, s)| s == "main")
        .count();
    assert_eq!(mains, 3);

    // Assertions are never transient.
    let dir2 = tempfile::tempdir().unwrap();
    let jobs2 = common::FakeJobManager::new();
    jobs2.on_stage("ID.ps2.P.S", |_| {
        FakeOutcome::Assert("expected sorted input".to_string())
    });
    let mut rt2 = fake_runtime(common::test_runtime_options(), jobs2.clone());
    rt2.retry = RetryConfig::new(5, &[".*"]);
    let src2 = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps2 = invoke(&rt2, &callables, &src2, "ps2", dir2.path());
    let result = with_timeout(ps2.run_loop(&rt2)).await;
    assert_eq!(result.state(), MetadataState::Failed);
    assert_eq!(
        jobs2
            .dispatched()
            .into_iter()
            .filter(|(_, s)| s == "main")
            .count(),
        1
    );
}
