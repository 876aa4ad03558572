// tests/common/mod.rs

#![allow(dead_code)]

pub use martian_test_utils::builders;
pub use martian_test_utils::fake_jobs::{FakeJob, FakeJobManager, FakeOutcome};
pub use martian_test_utils::{init_tracing, test_runtime_options, with_timeout};

use std::collections::HashMap;
use std::sync::Arc;

use martian::pipestance::Pipestance;
use martian::runtime::{Runtime, RuntimeOptions};
use martian::syntax::Callables;

/// A runtime wired to a fake job manager for both local and remote routes.
pub fn fake_runtime(options: RuntimeOptions, jobs: Arc<FakeJobManager>) -> Runtime {
    Runtime::new(options)
        .expect("runtime construction")
        .with_job_manager(jobs.clone())
        .with_local_job_manager(jobs)
}

/// Invoke a fresh pipestance under `dir` from builder-produced callables.
pub fn invoke(
    rt: &Runtime,
    callables: &Callables,
    src: &str,
    psid: &str,
    dir: &std::path::Path,
) -> Pipestance {
    rt.invoke_pipeline(
        src,
        callables,
        psid,
        &dir.join(psid),
        "test-pipelines-1.0",
        &HashMap::new(),
        &[],
    )
    .expect("invoke_pipeline")
}
