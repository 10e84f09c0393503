// tests/process_executor.rs
#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use forecycle::chain::{CommandTemplate, StageDescriptor, SuccessMarkers};
use forecycle::config::MarkerConfig;
use forecycle::exec::{
    AttemptArtifacts, AttemptContext, AttemptResult, AttemptSummary, Interrupt,
    ProcessStageRunner, StageOutcome, StageRunner,
};
use forecycle::fs::RealFileSystem;
use forecycle::state::CycleId;
use forecycle::types::OutputStream;
use forecycle_test_utils::{init_tracing, utc, with_timeout};

fn stage(name: &str, cmd: &str) -> StageDescriptor {
    StageDescriptor::new(name, CommandTemplate::parse(cmd).unwrap())
}

fn context(workdir: &Path, attempt: u32) -> AttemptContext {
    let reference_time = utc(2024, 3, 10, 0, 0);
    AttemptContext {
        cycle_id: CycleId::new("coastal", reference_time),
        chain: "coastal".to_string(),
        reference_time,
        end_time: utc(2024, 3, 13, 0, 0),
        workdir: workdir.to_path_buf(),
        attempt,
    }
}

async fn run(stage: &StageDescriptor, ctx: &AttemptContext) -> AttemptResult {
    let (_tx, rx) = watch::channel(None);
    ProcessStageRunner::default().execute(stage, ctx, rx).await
}

fn summary(workdir: &Path, stage: &str, attempt: u32) -> AttemptSummary {
    let path = AttemptArtifacts::new(workdir, stage, attempt).summary_path();
    AttemptSummary::load(&RealFileSystem, &path).unwrap()
}

#[tokio::test]
async fn successful_stage_writes_logs_and_summary() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let stage = stage(
        "prepare",
        "echo ref={ref:%Y%m%d%H} end={end:%Y%m%d} stage={stage} attempt={attempt}",
    );
    let ctx = context(dir.path(), 1);

    let result = with_timeout(run(&stage, &ctx)).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::Success));

    let artifacts = AttemptArtifacts::new(dir.path(), "prepare", 1);
    let stdout = std::fs::read_to_string(artifacts.stdout_log()).unwrap();
    assert_eq!(
        stdout.trim(),
        "ref=2024031000 end=20240313 stage=prepare attempt=1"
    );

    let summary = summary(dir.path(), "prepare", 1);
    assert_eq!(summary.outcome, "SUCCESS");
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(summary.cycle_id, "coastal@20240310T0000Z");
    assert!(summary.command.starts_with("echo ref=2024031000"));
}

#[tokio::test]
async fn process_sees_cycle_environment_and_runs_in_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage(
        "model",
        "echo \"$FORECYCLE_CYCLE_ID $FORECYCLE_STAGE $FORECYCLE_REF_TIME $DOMAIN\" > env.txt",
    )
    .with_cwd("exe")
    .with_env("DOMAIN", "tagus");
    let ctx = context(dir.path(), 1);

    let result = with_timeout(run(&stage, &ctx)).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::Success));

    let written = std::fs::read_to_string(dir.path().join("exe/env.txt")).unwrap();
    assert_eq!(
        written.trim(),
        "coastal@20240310T0000Z model 2024-03-10T00:00:00Z tagus"
    );
}

#[tokio::test]
async fn nonzero_exit_fails_with_stderr_tail() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "echo 'NaN in velocity field' >&2; exit 3");
    let ctx = context(dir.path(), 2);

    let result = with_timeout(run(&stage, &ctx)).await;
    assert_eq!(
        result,
        AttemptResult::Finished(StageOutcome::Failed {
            exit_code: 3,
            diagnostic: "NaN in velocity field".to_string(),
        })
    );
    let summary = summary(dir.path(), "model", 2);
    assert_eq!(summary.outcome, "FAILED");
    assert_eq!(summary.exit_code, Some(3));
}

#[tokio::test]
async fn accepted_exit_code_range_counts_as_success() {
    let dir = tempfile::tempdir().unwrap();
    let markers = SuccessMarkers::compile(&[MarkerConfig::ExitCode { min: 0, max: 1 }]).unwrap();
    let stage = stage("model", "exit 1").with_markers(markers);

    let result = with_timeout(run(&stage, &context(dir.path(), 1))).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::Success));
}

#[tokio::test]
async fn timeout_kills_the_process() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "sleep 30").with_timeout(Duration::from_millis(200));
    let ctx = context(dir.path(), 1);

    let started = Instant::now();
    let result = with_timeout(run(&stage, &ctx)).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary(dir.path(), "model", 1).outcome, "TIMED_OUT");
}

#[tokio::test]
async fn timeout_kills_every_process_the_shell_started() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "(sleep 1; touch still_alive); true")
        .with_timeout(Duration::from_millis(200));
    let ctx = context(dir.path(), 1);

    let result = with_timeout(run(&stage, &ctx)).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::TimedOut));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!dir.path().join("still_alive").exists());
}

#[tokio::test]
async fn missing_markers_are_reported_despite_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let markers = SuccessMarkers::compile(&[
        MarkerConfig::File {
            glob: "out/*.nc".to_string(),
            min_count: 1,
        },
        MarkerConfig::Pattern {
            regex: "successfully terminated".to_string(),
            stream: OutputStream::Stdout,
            file: None,
        },
    ])
    .unwrap();
    let stage = stage("model", "echo 'program aborted'").with_markers(markers);

    let result = with_timeout(run(&stage, &context(dir.path(), 1))).await;
    let AttemptResult::Finished(StageOutcome::MarkersMissing { missing }) = result else {
        panic!("expected MarkersMissing, got {result:?}");
    };
    assert_eq!(missing.len(), 2);
    assert_eq!(summary(dir.path(), "model", 1).missing_markers, missing);
}

#[tokio::test]
async fn satisfied_markers_fingerprint_matched_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let markers = SuccessMarkers::compile(&[
        MarkerConfig::File {
            glob: "out/*.nc".to_string(),
            min_count: 1,
        },
        MarkerConfig::Pattern {
            regex: "successfully terminated".to_string(),
            stream: OutputStream::Stdout,
            file: None,
        },
    ])
    .unwrap();
    let stage = stage(
        "model",
        "mkdir -p out && printf 'hello world' > out/hydro.nc && echo 'Program successfully terminated'",
    )
    .with_markers(markers);

    let result = with_timeout(run(&stage, &context(dir.path(), 1))).await;
    assert_eq!(result, AttemptResult::Finished(StageOutcome::Success));

    let summary = summary(dir.path(), "model", 1);
    // blake3 of "hello world"
    assert_eq!(
        summary.fingerprints.get("out/hydro.nc").map(String::as_str),
        Some("d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24")
    );
}

#[tokio::test]
async fn attempts_never_overwrite_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "echo run {attempt}");

    with_timeout(run(&stage, &context(dir.path(), 1))).await;
    with_timeout(run(&stage, &context(dir.path(), 2))).await;

    let first = AttemptArtifacts::new(dir.path(), "model", 1).stdout_log();
    let second = AttemptArtifacts::new(dir.path(), "model", 2).stdout_log();
    assert_eq!(std::fs::read_to_string(first).unwrap().trim(), "run 1");
    assert_eq!(std::fs::read_to_string(second).unwrap().trim(), "run 2");
}

#[tokio::test]
async fn interrupt_kills_the_process_and_records_it() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "sleep 30");
    let ctx = context(dir.path(), 1);
    let (tx, rx) = watch::channel(None);
    let runner = ProcessStageRunner::default();

    let started = Instant::now();
    let attempt = runner.execute(&stage, &ctx, rx);
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Some(Interrupt::Cancel)).unwrap();
    };
    let (result, ()) = with_timeout(async { tokio::join!(attempt, cancel) }).await;

    assert_eq!(result, AttemptResult::Interrupted(Interrupt::Cancel));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary(dir.path(), "model", 1).outcome, "CANCELLED");
}

#[tokio::test]
async fn interrupt_kills_background_children_too() {
    let dir = tempfile::tempdir().unwrap();
    let stage = stage("model", "(sleep 1; touch still_alive) & wait");
    let ctx = context(dir.path(), 1);
    let (tx, rx) = watch::channel(None);
    let runner = ProcessStageRunner::default();

    let attempt = runner.execute(&stage, &ctx, rx);
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(Some(Interrupt::Shutdown)).unwrap();
    };
    let (result, ()) = with_timeout(async { tokio::join!(attempt, shutdown) }).await;
    assert_eq!(result, AttemptResult::Interrupted(Interrupt::Shutdown));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!dir.path().join("still_alive").exists());
    assert_eq!(summary(dir.path(), "model", 1).outcome, "INTERRUPTED");
}
