// tests/scheduler_scenarios.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use forecycle::chain::ChainSet;
use forecycle::engine::{CycleScheduler, SchedulerState};
use forecycle::state::{
    Cycle, CycleId, CycleStatus, CycleStore, FileCycleStore, Journal, Lease, MemoryCycleStore,
};
use forecycle_test_utils::builders::{
    ChainConfigBuilder, ConfigFileBuilder, StageConfigBuilder, coastal_chain,
};
use forecycle_test_utils::{init_tracing, utc};

const WORK_ROOT: &str = "/srv/runs";

fn chains_with(name: &str, chain: forecycle::config::ChainConfig) -> ChainSet {
    ConfigFileBuilder::new()
        .with_chain(name, chain)
        .build()
        .chains()
        .clone()
}

fn scheduler(chains: ChainSet, store: Arc<dyn CycleStore>) -> CycleScheduler {
    CycleScheduler::new(
        chains,
        store,
        Arc::new(Journal::disabled()),
        PathBuf::from(WORK_ROOT),
        Duration::from_secs(30 * 24 * 3600),
    )
}

fn single_stage(cadence: &str) -> ChainConfigBuilder {
    ChainConfigBuilder::new(cadence).stage("run", StageConfigBuilder::new("true").build())
}

#[test]
fn daily_window_is_created_once_at_its_lead_time() {
    init_tracing();

    let store = Arc::new(MemoryCycleStore::new());
    let chains = chains_with("coastal", coastal_chain());
    let scheduler = scheduler(chains.clone(), store.clone());
    let mut state = SchedulerState::new();

    let report = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 0))
        .unwrap();
    let expected = CycleId::new("coastal", utc(2024, 3, 10, 0, 0));
    assert_eq!(report.created, vec![expected.clone()]);
    assert_eq!(report.runnable, vec![expected.clone()]);

    let cycle = store.load(&expected).unwrap().unwrap();
    assert_eq!(cycle.status, CycleStatus::Pending);
    assert_eq!(cycle.current_stage_index, 0);
    assert_eq!(cycle.attempt_count, 0);
    let chain = chains.get("coastal").unwrap();
    assert_eq!(
        cycle.working_directory,
        chain.working_directory(Path::new(WORK_ROOT), utc(2024, 3, 10, 0, 0))
    );

    // The cycle is now being driven by this process.
    state.in_flight.insert(expected.clone());
    let report = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 5))
        .unwrap();
    assert!(report.created.is_empty());
    assert!(report.runnable.is_empty());
    assert_eq!(store.list().unwrap().len(), 1);
    assert_eq!(state.last_poll, Some(utc(2024, 3, 10, 6, 5)));
}

#[test]
fn before_lead_time_only_the_previous_window_is_due() {
    let store = Arc::new(MemoryCycleStore::new());
    let scheduler = scheduler(chains_with("coastal", coastal_chain()), store.clone());
    let mut state = SchedulerState::new();

    let created = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 5, 59))
        .unwrap()
        .created;
    assert_eq!(
        created,
        vec![CycleId::new("coastal", utc(2024, 3, 9, 0, 0))]
    );
}

#[test]
fn catch_up_creates_missing_windows_newest_first() {
    let store = Arc::new(MemoryCycleStore::new());
    let chain = single_stage("24h").lead_time("6h").catch_up(2).build();
    let scheduler = scheduler(chains_with("coastal", chain), store.clone());
    let mut state = SchedulerState::new();

    let created = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 0))
        .unwrap()
        .created;
    assert_eq!(
        created,
        vec![
            CycleId::new("coastal", utc(2024, 3, 10, 0, 0)),
            CycleId::new("coastal", utc(2024, 3, 9, 0, 0)),
            CycleId::new("coastal", utc(2024, 3, 8, 0, 0)),
        ]
    );

    // Runnable is reported oldest first.
    let runnable = scheduler
        .poll(&mut state, utc(2024, 3, 10, 6, 1))
        .unwrap();
    assert_eq!(runnable.first(), Some(&CycleId::new("coastal", utc(2024, 3, 8, 0, 0))));
}

#[test]
fn offset_and_hourly_cadence_align_the_grid() {
    let store = Arc::new(MemoryCycleStore::new());
    let chain = single_stage("6h").offset("3h").lead_time("1h").build();
    let scheduler = scheduler(chains_with("hourly", chain), store);
    let mut state = SchedulerState::new();

    let created = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 10, 30))
        .unwrap()
        .created;
    assert_eq!(created, vec![CycleId::new("hourly", utc(2024, 3, 10, 9, 0))]);
}

#[test]
fn weekday_filter_keeps_only_matching_windows() {
    let store = Arc::new(MemoryCycleStore::new());
    let chain = single_stage("24h").catch_up(6).weekday("sun").build();
    let scheduler = scheduler(chains_with("restart", chain), store);
    let mut state = SchedulerState::new();

    // Wednesday 2024-03-13; the Sunday before is 2024-03-10.
    let created = scheduler
        .poll_report(&mut state, utc(2024, 3, 13, 6, 0))
        .unwrap()
        .created;
    assert_eq!(created, vec![CycleId::new("restart", utc(2024, 3, 10, 0, 0))]);
}

#[test]
fn not_before_suppresses_older_windows() {
    let store = Arc::new(MemoryCycleStore::new());
    let chain = single_stage("24h")
        .catch_up(3)
        .not_before("2024-03-09T00:00:00Z")
        .build();
    let scheduler = scheduler(chains_with("coastal", chain), store);
    let mut state = SchedulerState::new();

    let created = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 1, 0))
        .unwrap()
        .created;
    assert_eq!(
        created,
        vec![
            CycleId::new("coastal", utc(2024, 3, 10, 0, 0)),
            CycleId::new("coastal", utc(2024, 3, 9, 0, 0)),
        ]
    );
}

#[test]
fn concurrent_pollers_create_each_window_exactly_once() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let chains = chains_with("coastal", coastal_chain());
    let now = utc(2024, 3, 10, 6, 0);

    let created: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let chains = chains.clone();
                let state_dir = dir.path().to_path_buf();
                s.spawn(move || {
                    let store = Arc::new(FileCycleStore::open(&state_dir).unwrap());
                    let scheduler = scheduler(chains, store);
                    let mut state = SchedulerState::new();
                    scheduler.poll_report(&mut state, now).unwrap().created.len()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });

    assert_eq!(created, 1);
    let store = FileCycleStore::open(dir.path()).unwrap();
    let records = store.list().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].cycle_id, CycleId::new("coastal", utc(2024, 3, 10, 0, 0)));
}

#[test]
fn stale_cycles_are_handed_back_and_live_ones_are_not() {
    let store = Arc::new(MemoryCycleStore::new());
    let chains = chains_with("coastal", single_stage("24h").catch_up(1).build());
    let chain = chains.get("coastal").unwrap().clone();
    let scheduler = scheduler(chains, store.clone());
    let now = utc(2024, 3, 10, 6, 0);

    // Yesterday's cycle: crashed mid-stage, lease long expired.
    let mut stale = Cycle::new_pending(&chain, utc(2024, 3, 9, 0, 0), Path::new(WORK_ROOT), now);
    stale.status = CycleStatus::Running;
    stale.launch_count = 1;
    stale.lease = Some(Lease {
        owner: "crashed-host-1".into(),
        expires_at: now - TimeDelta::minutes(20),
    });
    assert!(store.create(&stale).unwrap());

    // Today's cycle: another process is actively driving it.
    let mut live = Cycle::new_pending(&chain, utc(2024, 3, 10, 0, 0), Path::new(WORK_ROOT), now);
    live.status = CycleStatus::Running;
    live.lease = Some(Lease {
        owner: "other-host-7".into(),
        expires_at: now + TimeDelta::minutes(10),
    });
    assert!(store.create(&live).unwrap());

    let mut state = SchedulerState::new();
    let report = scheduler.poll_report(&mut state, now).unwrap();
    assert!(report.created.is_empty());
    assert_eq!(report.runnable, vec![stale.cycle_id.clone()]);
}

#[test]
fn terminal_cycles_are_never_relaunched() {
    let store = Arc::new(MemoryCycleStore::new());
    let chains = chains_with("coastal", coastal_chain());
    let chain = chains.get("coastal").unwrap().clone();
    let scheduler = scheduler(chains, store.clone());
    let now = utc(2024, 3, 10, 6, 0);

    let mut done = Cycle::new_pending(&chain, utc(2024, 3, 10, 0, 0), Path::new(WORK_ROOT), now);
    done.status = CycleStatus::FailedTerminal;
    assert!(store.create(&done).unwrap());

    let mut state = SchedulerState::new();
    let report = scheduler.poll_report(&mut state, now).unwrap();
    assert!(report.created.is_empty());
    assert!(report.runnable.is_empty());
}

#[test]
fn failed_creates_are_skipped_and_reported() {
    let store = Arc::new(MemoryCycleStore::new());
    store.set_fail_writes(true);
    let scheduler = scheduler(chains_with("coastal", coastal_chain()), store.clone());
    let mut state = SchedulerState::new();

    let report = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 0))
        .unwrap();
    assert!(report.created.is_empty());
    assert_eq!(
        report.skipped,
        [CycleId::new("coastal", utc(2024, 3, 10, 0, 0))]
    );

    // The window is created once the store recovers.
    store.set_fail_writes(false);
    let report = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 5))
        .unwrap();
    assert_eq!(report.created.len(), 1);
    assert!(report.skipped.is_empty());
}

#[test]
fn corrupt_record_only_holds_back_its_own_window() {
    init_tracing();

    let dir = tempfile::tempdir().unwrap();
    let chains = ConfigFileBuilder::new()
        .with_chain("a", single_stage("24h").build())
        .with_chain("b", single_stage("24h").build())
        .build()
        .chains()
        .clone();
    let store = Arc::new(FileCycleStore::open(dir.path()).unwrap());
    let broken = CycleId::new("a", utc(2024, 3, 10, 0, 0));
    std::fs::write(store.root().join(format!("{broken}.json")), b"{ half a rec").unwrap();

    let scheduler = scheduler(chains, store.clone());
    let mut state = SchedulerState::new();
    let report = scheduler
        .poll_report(&mut state, utc(2024, 3, 10, 6, 0))
        .unwrap();

    let healthy = CycleId::new("b", utc(2024, 3, 10, 0, 0));
    assert_eq!(report.created, [healthy.clone()]);
    assert_eq!(report.runnable, [healthy.clone()]);
    assert_eq!(report.skipped, [broken]);
    assert!(store.load(&healthy).unwrap().is_some());
}
