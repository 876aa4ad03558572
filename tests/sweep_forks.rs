// tests/sweep_forks.rs

//! Sweep expansion: one fork per element of the cartesian product, stable
//! indices, aligned parent forks, independent completion.

mod common;

use common::builders::{refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeOutcome};

use serde_json::json;

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
async fn sweep_of_three_yields_three_aligned_forks() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.S", |job| {
        let x = job.args["x"].as_i64().unwrap();
        FakeOutcome::Success([("y".to_string(), json!(10 * x))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P")
        .sweep("x", vec![json!(1), json!(2), json!(3)])
        .source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    // Fork multiplicity is decided at graph build time.
    let s_id = ps.graph().find("ID.ps1.P.S").unwrap();
    assert_eq!(ps.graph().node(s_id).forks.len(), 3);
    for (i, fork) in ps.graph().node(s_id).forks.iter().enumerate() {
        assert_eq!(fork.index, i);
        let permute: Vec<_> = fork.arg_permute.values().collect();
        assert_eq!(permute, vec![&json!(i as i64 + 1)]);
        // Each subfork is linked to the pipeline fork with the matching
        // permutation.
        assert_eq!(fork.parent_fork.unwrap().index, i);
    }

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    for i in 0..3 {
        let fork_dir = dir
            .path()
            .join("ps1")
            .join("P")
            .join("S")
            .join(format!("fork{i}"));
        assert!(fork_dir.join("_complete").exists());
        let outs: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(fork_dir.join("_outs")).unwrap())
                .unwrap();
        assert_eq!(outs["y"], json!(10 * (i as i64 + 1)));
    }

    // `_perf` lists one record per fork, for the stage and the pipeline.
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
    assert_eq!(stage_perf["forks"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn empty_sweep_set_yields_exactly_one_fork() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P").arg("x", json!(5)).source(&callables);
    let ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    for id in ps.graph().ids() {
        let node = ps.graph().node(id);
        assert_eq!(node.forks.len(), 1, "{} should have one fork", node.fqname);
        assert!(node.forks[0].arg_permute.is_empty());
    }
}

#[tokio::test]
async fn fork_indices_are_stable_across_rebuilds() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = callables();
    let src = InvocationBuilder::new("P")
        .sweep("x", vec![json!(3), json!(1), json!(2)])
        .source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());
    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let permutes = |ps: &martian::Pipestance| -> Vec<Vec<serde_json::Value>> {
        let id = ps.graph().find("ID.ps1.P.S").unwrap();
        ps.graph()
            .node(id)
            .forks
            .iter()
            .map(|f| f.arg_permute.values().cloned().collect())
            .collect()
    };
    let first = permutes(&ps);
    drop(ps);

    // Rebuild the same graph via reattach; fork indices must match.
    let reattached = rt
        .reattach_to_pipestance(
            "ps1",
            &dir.path().join("ps1"),
            None,
            &callables,
            "test-pipelines-1.0",
            &std::collections::HashMap::new(),
            true,
            false,
        )
        .expect("reattach");
    assert_eq!(permutes(&reattached), first);
}
