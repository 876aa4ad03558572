// tests/vdr_rolling.rs

//! Rolling VDR: a volatile stage's output files are deleted once every
//! consumer finishes, and never while one is still pending; pipeline-level
//! outputs are pinned.

mod common;

use common::builders::{refr, self_ref, CallBuilder, InvocationBuilder, PipelineBuilder, StageBuilder};
use common::{fake_runtime, init_tracing, invoke, with_timeout, FakeJob, FakeOutcome};

use serde_json::json;

use martian::perf::VdrKillReport;
use martian::syntax::Callables;
use martian::types::MetadataState;

/// A "main" handler that writes `big.bam` into the chunk's files directory
/// and returns it as the `bam` output.
fn write_bam(job: &FakeJob<'_>) -> FakeOutcome {
    let path = job.metadata.files_path().join("big.bam");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();
    FakeOutcome::Success(
        [("bam".to_string(), json!(path.to_string_lossy()))]
            .into_iter()
            .collect(),
    )
}

#[tokio::test]
async fn volatile_output_is_deleted_after_consumer_completes() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.A", write_bam);
    jobs.on_stage("ID.ps1.P.B", |job| {
        // The consumer sees the file while it runs.
        let bam = job.args["bam"].as_str().unwrap();
        assert!(std::path::Path::new(bam).exists(), "input deleted too early");
        FakeOutcome::Success([("n".to_string(), json!(1))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = Callables::new([
        StageBuilder::new("A").output("bam", "bam").build(),
        StageBuilder::new("B")
            .input("bam", "bam")
            .output("n", "int")
            .build(),
        PipelineBuilder::new("P")
            .output("n", "int")
            .call(CallBuilder::new("A").volatile().build())
            .call(CallBuilder::new("B").bind("bam", "bam", refr("A", "bam")).build())
            .ret("n", "int", refr("B", "n"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let a_fork = dir.path().join("ps1").join("P").join("A").join("fork0");
    let bam = a_fork.join("chnk0").join("files").join("big.bam");
    assert!(!bam.exists(), "volatile file should be collected");

    let report: VdrKillReport = serde_json::from_str(
        &std::fs::read_to_string(a_fork.join("_vdrkill")).unwrap(),
    )
    .unwrap();
    assert!(report.count > 0);
    assert!(report.size >= 4096);
    assert!(report
        .events
        .iter()
        .any(|e| e.path.ends_with("big.bam") || e.path.ends_with("files")));
}

#[tokio::test]
async fn pipeline_level_outputs_are_pinned() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.A", write_bam);
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    // The top-level pipeline itself binds A.bam: that pins the file even
    // though A is volatile and has no other consumer.
    let callables = Callables::new([
        StageBuilder::new("A").output("bam", "bam").build(),
        PipelineBuilder::new("P")
            .output("bam", "bam")
            .call(CallBuilder::new("A").volatile().build())
            .ret("bam", "bam", refr("A", "bam"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let a_id = ps.graph().find("ID.ps1.P.A").unwrap();
    let fork = &ps.graph().node(a_id).forks[0];
    // The asymmetry under test: the argument is recorded with a pinned
    // consumer, but no post-node entry exists for the top-level pipeline.
    assert!(fork.file_args["bam"].contains(&None));
    assert!(fork.file_post_nodes.is_empty());

    let bam = dir
        .path()
        .join("ps1")
        .join("P")
        .join("A")
        .join("fork0")
        .join("chnk0")
        .join("files")
        .join("big.bam");
    assert!(bam.exists(), "pipeline-level output must be pinned");
}

#[tokio::test]
async fn non_volatile_stages_are_never_collected() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let jobs = common::FakeJobManager::new();
    jobs.on_stage("ID.ps1.P.A", write_bam);
    jobs.on_stage("ID.ps1.P.B", |_| {
        FakeOutcome::Success([("n".to_string(), json!(1))].into_iter().collect())
    });
    let rt = fake_runtime(common::test_runtime_options(), jobs);

    let callables = Callables::new([
        StageBuilder::new("A").output("bam", "bam").build(),
        StageBuilder::new("B")
            .input("bam", "bam")
            .output("n", "int")
            .build(),
        PipelineBuilder::new("P")
            .output("n", "int")
            .call(CallBuilder::new("A").build())
            .call(CallBuilder::new("B").bind("bam", "bam", refr("A", "bam")).build())
            .ret("n", "int", refr("B", "n"))
            .build(),
    ]);
    let src = InvocationBuilder::new("P").source(&callables);
    let mut ps = invoke(&rt, &callables, &src, "ps1", dir.path());

    let result = with_timeout(ps.run_loop(&rt)).await;
    assert_eq!(result.state(), MetadataState::Complete);

    let bam = dir
        .path()
        .join("ps1")
        .join("P")
        .join("A")
        .join("fork0")
        .join("chnk0")
        .join("files")
        .join("big.bam");
    assert!(bam.exists(), "non-volatile outputs stay");
}
