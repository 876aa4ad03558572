// tests/reattach.rs

//! Reattachment: invocation drift detection, AST-equivalence checking, job
//! mode verification, and restart of in-flight work.

mod common;

use common::builders::{refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeOutcome};

use std::collections::HashMap;

use serde_json::json;

use martian::syntax::Callables;
use martian::types::MetadataState;
use martian::MartianError;

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
async fn drifted_invocation_is_rejected_without_state_changes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src_v1 = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let ps = invoke(&rt, &callables, &src_v1, "ps1", dir.path());
    drop(ps); // releases the lock

    let before: Vec<_> = walk(dir.path());

    let src_v2 = InvocationBuilder::new("P").arg("x", json!(2)).source(&callables);
    let err = rt
        .reattach_to_pipestance(
            "ps1",
            &dir.path().join("ps1"),
            Some(&src_v2),
            &callables,
            "test-pipelines-1.0",
            &HashMap::new(),
            true,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, MartianError::PipestanceInvocation { .. }));
    assert_eq!(err.exit_code(), 1);

    // Nothing on disk moved.
    assert_eq!(walk(dir.path()), before);
}

#[tokio::test]
async fn matching_invocation_reattaches_and_completes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.S", |job| {
        let x = job.args["x"].as_i64().unwrap();
        FakeOutcome::Success([("y".to_string(), json!(x + 1))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let ps = invoke(&rt, &callables, &src, "ps1", dir.path());
    drop(ps);

    // Reattach from `_invocation`, with the mrosource equivalence check on.
    let mut ps = rt
        .reattach_to_pipestance(
            "ps1",
            &dir.path().join("ps1"),
            None,
            &callables,
            "test-pipelines-1.0",
            &HashMap::new(),
            true,
            false,
        )
        .expect("reattach");
    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);
}

#[tokio::test]
async fn reattach_from_mrosource_is_equivalent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(3)).source(&callables);
    let ps = invoke(&rt, &callables, &src, "ps1", dir.path());
    drop(ps);

    let ps = rt
        .reattach_to_pipestance_with_mro_src(
            "ps1",
            &dir.path().join("ps1"),
            None,
            &callables,
            "test-pipelines-1.0",
            &HashMap::new(),
            true,
            false,
        )
        .expect("reattach from mrosource");
    assert_eq!(ps.invocation().call, "P");
    assert_eq!(ps.invocation().args["x"], json!(3));
}

#[tokio::test]
async fn mismatched_job_mode_is_rejected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let ps = invoke(&rt, &callables, &src, "ps1", dir.path());
    drop(ps);

    let jobs = common::FakeJobManager::new();
    let mut options = common::test_runtime_options();
    options.job_mode = "sge".to_string();
    let rt_sge = fake_runtime(options, jobs);
    let err = rt_sge
        .reattach_to_pipestance(
            "ps1",
            &dir.path().join("ps1"),
            None,
            &callables,
            "test-pipelines-1.0",
            &HashMap::new(),
            false,
            false,
        )
        .unwrap_err();
    assert!(matches!(err, MartianError::JobModeMismatch { .. }));
}

#[tokio::test]
async fn queued_jobs_are_resubmitted_after_reattach() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    // The first runtime's job hangs: it only ever writes `_log`.
    jobs.on_stage("ID.ps1.P.S", |_| FakeOutcome::Hang);
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());
    // Dispatch the chunk, then "die" with it in flight.
    ps.refresh_state(&rt);
    ps.step_nodes(&rt);
    let s_id = ps.graph().find("ID.ps1.P.S").unwrap();
    assert_eq!(ps.graph().fork_state(s_id, 0), MetadataState::Running);
    drop(ps);

    // The second runtime's job completes normally.
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.S", |job| {
        let x = job.args["x"].as_i64().unwrap();
        FakeOutcome::Success([("y".to_string(), json!(x))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs.clone());
    let mut ps = rt
        .reattach_to_pipestance(
            "ps1",
            &dir.path().join("ps1"),
            None,
            &callables,
            "test-pipelines-1.0",
            &HashMap::new(),
            true,
            false,
        )
        .expect("reattach");

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);
    assert_eq!(
        jobs.dispatched()
            .into_iter()
            .filter(|(_, s)| s == "main")
            .count(),
        1,
        "the in-flight chunk is resubmitted exactly once"
    );
}

/// Sorted listing of every path under `root`, for before/after comparison.
fn walk(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path.clone());
                }
                out.push(path);
            }
        }
    }
    out.sort();
    out
}
