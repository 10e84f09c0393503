pub mod builders;
pub mod fake_runner;

use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing_subscriber::{fmt, EnvFilter};

use forecycle::chain::ChainSet;
use forecycle::engine::{Orchestrator, OrchestratorOptions};
use forecycle::exec::StageRunner;
use forecycle::fs::FileSystem;
use forecycle::state::{CycleStore, Journal};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// `YYYY-MM-DD HH:MM` in UTC.
pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0)
        .single()
        .expect("valid UTC timestamp")
}

pub const TEST_OWNER: &str = "test-owner";

/// Orchestrator with a 30s lease owned by [`TEST_OWNER`].
pub fn orchestrator(
    chains: ChainSet,
    store: Arc<dyn CycleStore>,
    runner: Arc<dyn StageRunner>,
    fs: Arc<dyn FileSystem>,
    work_root: &Path,
) -> Orchestrator {
    orchestrator_as(TEST_OWNER, chains, store, runner, fs, work_root)
}

pub fn orchestrator_as(
    owner: &str,
    chains: ChainSet,
    store: Arc<dyn CycleStore>,
    runner: Arc<dyn StageRunner>,
    fs: Arc<dyn FileSystem>,
    work_root: &Path,
) -> Orchestrator {
    Orchestrator::new(
        chains,
        store,
        runner,
        fs,
        Arc::new(Journal::disabled()),
        OrchestratorOptions {
            owner: owner.to_string(),
            work_root: work_root.to_path_buf(),
            lease_ttl: Duration::from_secs(30),
        },
    )
}
