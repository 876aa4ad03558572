// tests/nested_pipeline.rs

//! Subpipelines: fork alignment across the boundary, ForkWaiting while the
//! enclosing fork settles, and preflight gating.

mod common;

use common::builders::{refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeOutcome};

use serde_json::json;

use martian::syntax::Callables;
use martian::types::MetadataState;

/// GATE produces `skip`; SUB (a pipeline containing T) is disabled by it.
fn gated_callables() -> Callables {
    Callables::new([
        StageBuilder::new("GATE").output("skip", "bool").build(),
        StageBuilder::new("T")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("SUB")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("T").bind("x", "int", self_ref("x")).build())
            .ret("y", "int", refr("T", "y"))
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("GATE").build())
            .call(
                CallBuilder::new("SUB")
                    .bind("x", "int", self_ref("x"))
                    .disabled(refr("GATE", "skip"))
                    .build(),
            )
            .ret("y", "int", refr("SUB", "y"))
            .build(),
    ])
}

#[tokio::test]
async fn inner_stage_waits_for_the_gate_then_runs() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.GATE", |_| {
        FakeOutcome::Success([("skip".to_string(), json!(false))].into_iter().collect())
    });
    jobs.on_stage("ID.ps1.P.SUB.T", |job| {
        let x = job.args["x"].as_i64().unwrap();
        FakeOutcome::Success([("y".to_string(), json!(x + 100))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = gated_callables();
    let src = InvocationBuilder::new("P").arg("x", json!(5)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    // Before the gate resolves, the inner stage is structurally alive but
    // waiting on its enclosing fork.
    let t_id = ps.graph().find("ID.ps1.P.SUB.T").unwrap();
    assert_eq!(ps.graph().fork_state(t_id, 0), MetadataState::ForkWaiting);

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let p_outs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("ps1").join("P").join("fork0").join("_outs"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(p_outs["y"], json!(105));
}

#[tokio::test]
async fn disabled_subpipeline_disables_its_stages() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.GATE", |_| {
        FakeOutcome::Success([("skip".to_string(), json!(true))].into_iter().collect())
    });
    jobs.on_stage("ID.ps1.P.SUB.T", |_| {
        panic!("stage inside a disabled subpipeline must not run")
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs.clone());

    let callables = gated_callables();
    let src = InvocationBuilder::new("P").arg("x", json!(5)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let sub_id = ps.graph().find("ID.ps1.P.SUB").unwrap();
    assert_eq!(ps.graph().node_state(sub_id), MetadataState::DisabledState);
    let t_id = ps.graph().find("ID.ps1.P.SUB.T").unwrap();
    assert_eq!(ps.graph().fork_state(t_id, 0), MetadataState::DisabledState);

    let p_outs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("ps1").join("P").join("fork0").join("_outs"))
            .unwrap(),
    )
    .unwrap();
    assert_eq!(p_outs["y"], serde_json::Value::Null);
    assert!(jobs.dispatched().iter().all(|(fq, _)| fq.contains("GATE")));
}

#[tokio::test]
async fn sweeps_cross_the_subpipeline_boundary() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.SUB.T", |job| {
        let x = job.args["x"].as_i64().unwrap();
        FakeOutcome::Success([("y".to_string(), json!(x * x))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = Callables::new([
        StageBuilder::new("T")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("SUB")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("T").bind("x", "int", self_ref("x")).build())
            .ret("y", "int", refr("T", "y"))
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(CallBuilder::new("SUB").bind("x", "int", self_ref("x")).build())
            .ret("y", "int", refr("SUB", "y"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P")
        .sweep("x", vec![json!(2), json!(3)])
        .source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    // Two forks at every level, linked permutation-to-permutation.
    for fqname in ["ID.ps1.P", "ID.ps1.P.SUB", "ID.ps1.P.SUB.T"] {
        let id = ps.graph().find(fqname).unwrap();
        assert_eq!(ps.graph().node(id).forks.len(), 2, "{fqname}");
    }
    let t_id = ps.graph().find("ID.ps1.P.SUB.T").unwrap();
    for (i, fork) in ps.graph().node(t_id).forks.iter().enumerate() {
        let parent = fork.parent_fork.expect("inner forks are linked");
        assert_eq!(parent.index, i);
        assert_eq!(ps.graph().node(parent.node).fqname, "ID.ps1.P.SUB");
    }

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    for (i, expected) in [(0, 4), (1, 9)] {
        let outs: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(
                dir.path()
                    .join("ps1")
                    .join("P")
                    .join(format!("fork{i}"))
                    .join("_outs"),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(outs["y"], json!(expected));
    }
}

#[tokio::test]
async fn preflight_runs_before_everything_else() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.CHECK", |_| FakeOutcome::Success(Default::default()));
    jobs.on_stage("ID.ps1.P.WORK", |_| {
        FakeOutcome::Success([("y".to_string(), json!(1))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs.clone());

    let callables = Callables::new([
        StageBuilder::new("CHECK").input("x", "int").build(),
        StageBuilder::new("WORK")
            .input("x", "int")
            .output("y", "int")
            .build(),
        PipelineBuilder::new("P")
            .input("x", "int")
            .output("y", "int")
            .call(
                CallBuilder::new("CHECK")
                    .bind("x", "int", self_ref("x"))
                    .local()
                    .preflight()
                    .build(),
            )
            .call(CallBuilder::new("WORK").bind("x", "int", self_ref("x")).build())
            .ret("y", "int", refr("WORK", "y"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").arg("x", json!(1)).source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let order: Vec<String> = jobs.dispatched().into_iter().map(|(fq, _)| fq).collect();
    let check_pos = order.iter().position(|fq| fq.contains("CHECK")).unwrap();
    let work_pos = order.iter().position(|fq| fq.contains("WORK")).unwrap();
    assert!(check_pos < work_pos, "preflight must run first: {order:?}");
}
