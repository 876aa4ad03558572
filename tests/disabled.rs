// tests/disabled.rs

//! `disabled` modifier resolution: disabled forks satisfy dependencies,
//! resolve to null outputs, and a fully disabled pipeline exits cleanly.

mod common;

use common::builders::{lit, refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeOutcome};

use serde_json::json;

use martian::syntax::Callables;
use martian::types::MetadataState;

#[tokio::test]
async fn reference_disabled_stage_is_skipped_and_reads_as_null() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    // GATE decides whether EXPENSIVE runs.
    jobs.on_stage("ID.ps1.P.GATE", |_| {
        FakeOutcome::Success([("skip".to_string(), json!(true))].into_iter().collect())
    });
    jobs.on_stage("ID.ps1.P.EXPENSIVE", |_| {
        panic!("disabled stage must not be dispatched")
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs.clone());

    let callables = Callables::new([
        StageBuilder::new("GATE").output("skip", "bool").build(),
        StageBuilder::new("EXPENSIVE")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("GATE").build())
            .call(
                CallBuilder::new("EXPENSIVE")
                    .bind("x", "int", self_ref("x"))
                    .disabled(refr("GATE", "skip"))
                    .build(),
            )
            .ret("y", "int", refr("EXPENSIVE", "y"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let expensive = ps.graph().find("ID.ps1.P.EXPENSIVE").unwrap();
    assert_eq!(
        ps.graph().fork_state(expensive, 0),
        MetadataState::DisabledState
    );

    // The pipeline's output bound to the disabled stage resolves to null.
    let p_outs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("ps1").join("P").join("fork0").join("_outs"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(p_outs["y"], serde_json::Value::Null);

    // Only GATE ever ran.
    assert!(jobs.dispatched().iter().all(|(fq, _)| fq.contains("GATE")));
}

#[tokio::test]
async fn fully_disabled_pipeline_reaches_disabled_state_and_exits_zero() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs.clone());

    let callables = Callables::new([
        StageBuilder::new("S")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(
                CallBuilder::new("S")
                    .bind("x", "int", self_ref("x"))
                    .disabled(lit(json!(true)))
                    .build(),
            )
            .ret("y", "int", refr("S", "y"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::DisabledState);
    assert_eq!(result.exit_code(), 0);
    assert!(jobs.dispatched().is_empty());

    // The disabled marker survives for reattachment.
    assert!(dir
        .path()
        .join("ps1")
        .join("P")
        .join("S")
        .join("fork0")
        .join("_disabled")
        .exists());
}
