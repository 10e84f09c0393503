#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use forecycle::chain::ChainSet;
use forecycle::config::ConfigFile;
use forecycle::engine::{DriveOutcome, Orchestrator};
use forecycle::errors::Result;
use forecycle::exec::{Interrupt, InterruptReceiver};
use forecycle::fs::mock::MockFileSystem;
use forecycle::state::{Cycle, CycleId, CycleStore, MemoryCycleStore};
use forecycle_test_utils::fake_runner::ScriptedRunner;
use forecycle_test_utils::{orchestrator_as, TEST_OWNER};

pub const WORK_ROOT: &str = "/runs";

/// Everything one orchestrator test needs, wired to in-memory fakes.
pub struct Fixture {
    pub chains: ChainSet,
    pub store: Arc<MemoryCycleStore>,
    pub fs: MockFileSystem,
    pub runner: ScriptedRunner,
    pub orchestrator: Arc<Orchestrator>,
}

impl Fixture {
    pub fn new(cfg: &ConfigFile) -> Self {
        Self::with_store(cfg, Arc::new(MemoryCycleStore::new()), MockFileSystem::new(), TEST_OWNER)
    }

    /// A second process over the same store and filesystem.
    pub fn restarted(&self, owner: &str) -> Self {
        Self::with_store_chains(self.chains.clone(), self.store.clone(), self.fs.clone(), owner)
    }

    fn with_store(
        cfg: &ConfigFile,
        store: Arc<MemoryCycleStore>,
        fs: MockFileSystem,
        owner: &str,
    ) -> Self {
        Self::with_store_chains(cfg.chains().clone(), store, fs, owner)
    }

    fn with_store_chains(
        chains: ChainSet,
        store: Arc<MemoryCycleStore>,
        fs: MockFileSystem,
        owner: &str,
    ) -> Self {
        let runner = ScriptedRunner::with_fs(fs.clone());
        let orchestrator = orchestrator_as(
            owner,
            chains.clone(),
            store.clone(),
            Arc::new(runner.clone()),
            Arc::new(fs.clone()),
            Path::new(WORK_ROOT),
        );
        Self {
            chains,
            store,
            fs,
            runner,
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Insert a PENDING cycle for `chain` at `reference_time`.
    pub fn create(&self, chain: &str, reference_time: DateTime<Utc>) -> CycleId {
        let chain = self.chains.get(chain).expect("chain exists");
        let cycle = Cycle::new_pending(chain, reference_time, Path::new(WORK_ROOT), Utc::now());
        assert!(self.store.create(&cycle).unwrap());
        cycle.cycle_id
    }

    pub fn load(&self, id: &CycleId) -> Cycle {
        self.store.load(id).unwrap().expect("cycle exists")
    }

    /// Drive to the end with nobody ever interrupting.
    pub async fn drive(&self, id: &CycleId) -> Result<DriveOutcome> {
        let (_tx, rx) = watch::channel(None);
        self.orchestrator.drive(id, rx).await
    }

    /// Start driving in the background; the sender interrupts it.
    pub fn spawn_drive(
        &self,
        id: &CycleId,
    ) -> (
        watch::Sender<Option<Interrupt>>,
        tokio::task::JoinHandle<Result<DriveOutcome>>,
    ) {
        let (tx, rx): (_, InterruptReceiver) = watch::channel(None);
        let orchestrator = Arc::clone(&self.orchestrator);
        let id = id.clone();
        let handle = tokio::spawn(async move { orchestrator.drive(&id, rx).await });
        (tx, handle)
    }

    /// Wait until the runner has been asked to run `stage` `times` times.
    pub async fn wait_for_launch(&self, stage: &str, times: usize) {
        while self.runner.attempts_of(stage) < times {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    /// Make the record look abandoned: its lease expired long ago.
    pub fn expire_lease(&self, id: &CycleId) {
        let mut cycle = self.load(id);
        if let Some(lease) = cycle.lease.as_mut() {
            lease.expires_at = Utc::now() - chrono::TimeDelta::hours(1);
        }
        cycle.revision += 1;
        self.store.put(cycle);
    }
}
