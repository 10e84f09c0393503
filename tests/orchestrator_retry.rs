// tests/orchestrator_retry.rs

mod common;
use crate::common::{Fixture, WORK_ROOT};

use std::path::Path;

use forecycle::config::{ConfigFile, NotifyConfig};
use forecycle::engine::DriveOutcome;
use forecycle::errors::ForecycleError;
use forecycle::exec::{Interrupt, StageOutcome};
use forecycle::fs::FileSystem;
use forecycle::state::{CycleStatus, Lease, StageResult};
use forecycle_test_utils::builders::{ChainConfigBuilder, ConfigFileBuilder, StageConfigBuilder};
use forecycle_test_utils::fake_runner::ScriptedStep;
use forecycle_test_utils::{init_tracing, utc, with_timeout};

/// `prepare -> model -> post`, where `model` may retry `model_retries` times.
fn three_stage_config(model_retries: u32) -> ConfigFile {
    ConfigFileBuilder::new()
        .with_chain(
            "coastal",
            ChainConfigBuilder::new("24h")
                .lead_time("6h")
                .stage("prepare", StageConfigBuilder::new("prepare").build())
                .stage(
                    "model",
                    StageConfigBuilder::new("model")
                        .after("prepare")
                        .timeout("6h")
                        .retries(model_retries, "10ms")
                        .build(),
                )
                .stage("post", StageConfigBuilder::new("post").after("model").build())
                .build(),
        )
        .build()
}

fn failed(diagnostic: &str) -> StageOutcome {
    StageOutcome::Failed {
        exit_code: 1,
        diagnostic: diagnostic.to_string(),
    }
}

#[tokio::test]
async fn stage_timing_out_twice_then_succeeding_finishes_the_cycle() {
    init_tracing();

    let fx = Fixture::new(&three_stage_config(3));
    fx.runner.fail("model", StageOutcome::TimedOut, 2);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let outcome = with_timeout(fx.drive(&id)).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Finished(CycleStatus::Succeeded));

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::Succeeded);
    assert!(cycle.lease.is_none());
    assert!(cycle.finished_at.is_some());
    assert_eq!(cycle.last_diagnostic, None);

    let stages: Vec<_> = cycle.history.iter().map(|r| r.stage.as_str()).collect();
    assert_eq!(stages, ["prepare", "model", "post"]);
    assert_eq!(cycle.stage_record("prepare").unwrap().attempts, 1);
    assert_eq!(cycle.stage_record("model").unwrap().attempts, 3);
    assert_eq!(cycle.stage_record("model").unwrap().result, StageResult::Succeeded);
    assert_eq!(cycle.stage_record("post").unwrap().attempts, 1);

    assert_eq!(
        fx.runner.stages_run(),
        ["prepare", "model", "model", "model", "post"]
    );
    // Every launch of a stage gets its own artifact number.
    let model_attempts: Vec<u32> = fx
        .runner
        .calls()
        .iter()
        .filter(|c| c.stage == "model")
        .map(|c| c.attempt)
        .collect();
    assert_eq!(model_attempts, [1, 2, 3]);
}

#[tokio::test]
async fn exhausted_retries_end_in_failed_terminal() {
    init_tracing();

    let fx = Fixture::new(&three_stage_config(2));
    fx.runner.fail("model", failed("segfault in hydrodynamic core"), 3);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let outcome = with_timeout(fx.drive(&id)).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Finished(CycleStatus::FailedTerminal));

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::FailedTerminal);
    assert_eq!(cycle.current_stage_index, 1);
    assert!(cycle.lease.is_none());
    let diagnostic = cycle.last_diagnostic.clone().unwrap();
    assert!(diagnostic.starts_with("model: exit code 1"), "{diagnostic}");
    assert!(diagnostic.contains("segfault"));

    let record = cycle.history.last().unwrap();
    assert_eq!(record.stage, "model");
    assert_eq!(record.result, StageResult::Failed);
    assert_eq!(record.attempts, 3);

    // max_retries + 1 attempts, and the next stage never starts.
    assert_eq!(fx.runner.attempts_of("model"), 3);
    assert_eq!(fx.runner.attempts_of("post"), 0);

    // No further automatic attempts.
    let again = fx.drive(&id).await.unwrap();
    assert_eq!(again, DriveOutcome::Skipped);
    assert_eq!(fx.runner.attempts_of("model"), 3);
}

#[tokio::test]
async fn zero_retries_fail_on_first_error() {
    let fx = Fixture::new(&three_stage_config(0));
    fx.runner.push(
        "model",
        ScriptedStep::Finish(StageOutcome::MarkersMissing {
            missing: vec!["file 'out/*.nc'".to_string()],
        }),
    );
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let outcome = with_timeout(fx.drive(&id)).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Finished(CycleStatus::FailedTerminal));
    let cycle = fx.load(&id);
    assert_eq!(cycle.stage_record("model").unwrap().attempts, 1);
    assert!(cycle.last_diagnostic.unwrap().contains("markers missing"));
}

#[tokio::test]
async fn recovered_stage_resets_attempt_count_for_the_next_stage() {
    init_tracing();

    let fx = Fixture::new(&three_stage_config(3));
    fx.runner.fail("model", failed("transient"), 2);
    fx.runner.push("post", ScriptedStep::Hang);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let (tx, handle) = fx.spawn_drive(&id);
    with_timeout(fx.wait_for_launch("post", 1)).await;

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::Running);
    assert_eq!(cycle.current_stage_index, 2);
    assert_eq!(cycle.attempt_count, 0);
    assert_eq!(cycle.launch_count, 1);
    assert_eq!(cycle.stage_record("model").unwrap().attempts, 3);
    assert_eq!(
        cycle.lease.as_ref().map(|l| l.owner.as_str()),
        Some(forecycle_test_utils::TEST_OWNER)
    );

    // Shutdown leaves the cycle resumable and unowned.
    tx.send(Some(Interrupt::Shutdown)).unwrap();
    let outcome = with_timeout(handle).await.unwrap().unwrap();
    assert_eq!(outcome, DriveOutcome::Interrupted);

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::Running);
    assert!(cycle.lease.is_none());
    assert!(cycle.is_stale(chrono::Utc::now()));
}

#[tokio::test]
async fn shutdown_during_backoff_keeps_the_retry_pending() {
    let fx = Fixture::new(
        &ConfigFileBuilder::new()
            .with_chain(
                "coastal",
                ChainConfigBuilder::new("24h")
                    .stage(
                        "model",
                        StageConfigBuilder::new("model").retries(2, "1h").build(),
                    )
                    .build(),
            )
            .build(),
    );
    fx.runner.fail("model", failed("boom"), 1);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let (tx, handle) = fx.spawn_drive(&id);
    with_timeout(async {
        while fx.load(&id).status != CycleStatus::Retrying {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await;

    tx.send(Some(Interrupt::Shutdown)).unwrap();
    let outcome = with_timeout(handle).await.unwrap().unwrap();
    assert_eq!(outcome, DriveOutcome::Interrupted);

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::Retrying);
    assert!(cycle.retry_at.is_some());
    assert_eq!(cycle.attempt_count, 0);
    assert_eq!(fx.runner.attempts_of("model"), 1);
}

#[tokio::test]
async fn operator_cancel_stops_a_running_stage() {
    init_tracing();

    let fx = Fixture::new(&three_stage_config(3));
    fx.runner.push("model", ScriptedStep::Hang);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let (tx, handle) = fx.spawn_drive(&id);
    with_timeout(fx.wait_for_launch("model", 1)).await;
    tx.send(Some(Interrupt::Cancel)).unwrap();

    let outcome = with_timeout(handle).await.unwrap().unwrap();
    assert_eq!(outcome, DriveOutcome::Finished(CycleStatus::FailedTerminal));

    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::FailedTerminal);
    assert_eq!(cycle.last_diagnostic.as_deref(), Some("cancelled by operator"));
    assert_eq!(cycle.history.last().unwrap().result, StageResult::Cancelled);
    assert!(cycle.lease.is_none());
    assert_eq!(fx.runner.attempts_of("post"), 0);
}

#[tokio::test]
async fn live_foreign_lease_is_never_double_driven() {
    let fx = Fixture::new(&three_stage_config(0));
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let mut cycle = fx.load(&id);
    cycle.status = CycleStatus::Running;
    cycle.lease = Some(Lease {
        owner: "other-host-1".into(),
        expires_at: chrono::Utc::now() + chrono::TimeDelta::minutes(10),
    });
    fx.store.put(cycle);

    let outcome = fx.drive(&id).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Skipped);
    assert!(fx.runner.calls().is_empty());
    assert_eq!(
        fx.load(&id).lease.map(|l| l.owner),
        Some("other-host-1".to_string())
    );
}

#[tokio::test]
async fn losing_the_lease_mid_stage_halts_the_drive() {
    init_tracing();

    let fx = Fixture::new(&three_stage_config(0));
    fx.runner.push(
        "prepare",
        ScriptedStep::Slow(std::time::Duration::from_millis(200), StageOutcome::Success),
    );
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let (_tx, handle) = fx.spawn_drive(&id);
    with_timeout(fx.wait_for_launch("prepare", 1)).await;

    // Another process steals the record while the stage runs.
    let mut stolen = fx.load(&id);
    stolen.lease = Some(Lease {
        owner: "intruder".into(),
        expires_at: chrono::Utc::now() + chrono::TimeDelta::minutes(10),
    });
    stolen.revision += 1;
    fx.store.put(stolen);

    let outcome = with_timeout(handle).await.unwrap().unwrap();
    assert_eq!(outcome, DriveOutcome::LeaseLost);
    assert_eq!(fx.runner.attempts_of("model"), 0);
    let cycle = fx.load(&id);
    assert_eq!(cycle.lease.unwrap().owner, "intruder");
    assert_eq!(cycle.current_stage_index, 0);
}

#[tokio::test]
async fn store_failure_halts_instead_of_guessing() {
    let fx = Fixture::new(&three_stage_config(0));
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));
    fx.store.set_fail_writes(true);

    let err = fx.drive(&id).await.unwrap_err();
    assert!(matches!(err, ForecycleError::StateStore(_)), "{err:?}");
    assert!(fx.runner.calls().is_empty());
    assert_eq!(fx.load(&id).status, CycleStatus::Pending);
}

#[tokio::test]
async fn success_writes_the_notify_marker() {
    let fx = Fixture::new(
        &ConfigFileBuilder::new()
            .with_chain(
                "coastal",
                ChainConfigBuilder::new("24h")
                    .stage("model", StageConfigBuilder::new("model").build())
                    .notify(NotifyConfig {
                        marker: Some("READY.json".to_string()),
                        cmd: None,
                        on_failure: false,
                        timeout: "1m".to_string(),
                    })
                    .build(),
            )
            .build(),
    );
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    let outcome = with_timeout(fx.drive(&id)).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Finished(CycleStatus::Succeeded));

    let cycle = fx.load(&id);
    let marker = cycle.working_directory.join("READY.json");
    assert!(cycle.working_directory.starts_with(Path::new(WORK_ROOT)));
    let body: serde_json::Value =
        serde_json::from_str(&fx.fs.read_to_string(&marker).unwrap()).unwrap();
    assert_eq!(body["cycle_id"], id.as_str());
    assert_eq!(body["status"], "SUCCEEDED");
}

#[tokio::test]
async fn failed_cycle_skips_notify_unless_asked() {
    let fx = Fixture::new(
        &ConfigFileBuilder::new()
            .with_chain(
                "coastal",
                ChainConfigBuilder::new("24h")
                    .stage("model", StageConfigBuilder::new("model").build())
                    .notify(NotifyConfig {
                        marker: Some("READY.json".to_string()),
                        cmd: None,
                        on_failure: false,
                        timeout: "1m".to_string(),
                    })
                    .build(),
            )
            .build(),
    );
    fx.runner.fail("model", failed("boom"), 1);
    let id = fx.create("coastal", utc(2024, 3, 10, 0, 0));

    with_timeout(fx.drive(&id)).await.unwrap();
    let cycle = fx.load(&id);
    assert_eq!(cycle.status, CycleStatus::FailedTerminal);
    assert!(!fx.fs.exists(&cycle.working_directory.join("READY.json")));
}
