pub mod builders;
pub mod fake_jobs;

use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install a per-test tracing subscriber once per test binary.
///
/// Output goes through the libtest capture writer, so a passing test stays
/// quiet and a failing one dumps its engine logs. Level defaults to `info`;
/// override with `RUST_LOG` as usual.
pub fn init_tracing() {
    INIT.call_once(|| {
        fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Bound a pipestance-driving future so a scheduling bug cannot wedge the
/// whole test run. Ten seconds is generous: the fake job manager completes
/// work synchronously, so healthy tests finish in a few ticks.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("pipestance did not reach a terminal state in time")
}

/// Runtime options tuned for fast test loops.
pub fn test_runtime_options() -> martian::RuntimeOptions {
    martian::RuntimeOptions {
        step_interval: Duration::from_millis(5),
        ..martian::RuntimeOptions::default()
    }
}
