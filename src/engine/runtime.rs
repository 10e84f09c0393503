// src/engine/runtime.rs

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::control::operator::{self, CancelResult};
use crate::control::request::{self, ControlRequest};
use crate::errors::Result;
use crate::exec::Interrupt;
use crate::state::{CycleId, CycleStore, Journal};

use super::orchestrator::{DriveOutcome, Orchestrator};
use super::scheduler::{CycleScheduler, SchedulerState};
use super::RuntimeEvent;

/// Options for the daemon loop.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub poll_interval: Duration,
    pub max_concurrent_cycles: usize,
    pub retention: Duration,
    pub state_dir: PathBuf,
    /// Exit once nothing is running and nothing runnable is left
    /// (`run --once`).
    pub exit_when_idle: bool,
}

type DriveResult = (CycleId, Result<DriveOutcome>);

/// Daemon loop: polls the scheduler on a timer, drives runnable cycles
/// concurrently, reacts to control requests and shuts down cleanly.
///
/// The decisions live in the scheduler and the orchestrator; this struct
/// only does the async plumbing between them.
pub struct Runtime {
    scheduler: CycleScheduler,
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn CycleStore>,
    journal: Arc<Journal>,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    options: RuntimeOptions,
    state: SchedulerState,
    drives: JoinSet<DriveResult>,
    interrupts: BTreeMap<CycleId, watch::Sender<Option<Interrupt>>>,
    /// Cycles already launched since the last timer tick. Keeps a cycle
    /// that ends without progress from being relaunched in a tight loop.
    launched: BTreeSet<CycleId>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("in_flight", &self.state.in_flight)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        scheduler: CycleScheduler,
        orchestrator: Arc<Orchestrator>,
        journal: Arc<Journal>,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        options: RuntimeOptions,
    ) -> Self {
        let store = orchestrator.store().clone();
        Self {
            scheduler,
            orchestrator,
            store,
            journal,
            event_rx,
            options,
            state: SchedulerState::new(),
            drives: JoinSet::new(),
            interrupts: BTreeMap::new(),
            launched: BTreeSet::new(),
        }
    }

    /// Main loop. Returns after shutdown or, with `exit_when_idle`, once
    /// there is nothing left to drive.
    pub async fn run(mut self) -> Result<()> {
        info!(
            poll_interval_secs = self.options.poll_interval.as_secs(),
            max_concurrent_cycles = self.options.max_concurrent_cycles,
            "forecycle runtime started"
        );

        let mut ticker = tokio::time::interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first_tick = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.options.exit_when_idle && !first_tick {
                        continue;
                    }
                    first_tick = false;
                    self.launched.clear();
                    self.prune();
                    // Requests queued while no daemon was running, or left
                    // for an owner that has since gone.
                    self.handle_control();
                    self.poll_and_launch();
                }

                event = self.event_rx.recv() => match event {
                    Some(RuntimeEvent::PollRequested) => self.poll_and_launch(),
                    Some(RuntimeEvent::ControlPending) => self.handle_control(),
                    Some(RuntimeEvent::ShutdownRequested) | None => {
                        info!("shutdown requested");
                        break;
                    }
                },

                Some(joined) = self.drives.join_next(), if !self.drives.is_empty() => {
                    match joined {
                        Ok((id, result)) => self.drive_finished(id, result),
                        Err(e) => error!(error = %e, "cycle drive task panicked"),
                    }
                    // A slot opened up; fill it.
                    self.poll_and_launch();
                }
            }

            if self.options.exit_when_idle && !first_tick && self.drives.is_empty() {
                info!("nothing left to drive; exiting");
                break;
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// A failed poll is logged; running drives carry on and the next tick
    /// polls again.
    fn poll_and_launch(&mut self) {
        let runnable = match self.scheduler.poll(&mut self.state, Utc::now()) {
            Ok(runnable) => runnable,
            Err(e) => {
                error!(error = %e, "poll failed");
                return;
            }
        };
        for id in runnable {
            if self.drives.len() >= self.options.max_concurrent_cycles {
                debug!("concurrency limit reached; remaining cycles wait for the next poll");
                break;
            }
            if self.launched.contains(&id) {
                continue;
            }
            self.launch(id);
        }
    }

    fn launch(&mut self, id: CycleId) {
        let (tx, rx) = watch::channel(None);
        self.interrupts.insert(id.clone(), tx);
        self.state.in_flight.insert(id.clone());
        self.launched.insert(id.clone());

        let orchestrator = Arc::clone(&self.orchestrator);
        self.drives.spawn(async move {
            let result = orchestrator.drive(&id, rx).await;
            (id, result)
        });
    }

    fn drive_finished(&mut self, id: CycleId, result: Result<DriveOutcome>) {
        self.interrupts.remove(&id);
        self.state.in_flight.remove(&id);
        match result {
            Ok(outcome) => debug!(cycle_id = %id, ?outcome, "drive ended"),
            Err(e) => error!(cycle_id = %id, error = %e, "cycle halted"),
        }
    }

    fn handle_control(&mut self) {
        let state_dir = self.options.state_dir.clone();
        if let Err(e) = request::drain_with(&state_dir, |req| self.handle_request(req)) {
            warn!(error = %e, "could not read control requests");
        }
    }

    /// `false` leaves the request queued.
    fn handle_request(&mut self, req: ControlRequest) -> bool {
        match req {
            ControlRequest::Poll => {
                info!("poll requested by operator");
                self.launched.clear();
                self.poll_and_launch();
                true
            }
            ControlRequest::Cancel { cycle_id } => self.cancel(cycle_id),
        }
    }

    fn cancel(&mut self, id: CycleId) -> bool {
        if let Some(tx) = self.interrupts.get(&id) {
            info!(cycle_id = %id, "cancelling running cycle");
            let _ = tx.send(Some(Interrupt::Cancel));
            return true;
        }
        // Not ours: it may have stopped since the request was written.
        match self.store.load(&id) {
            Ok(Some(cycle)) if cycle.has_live_lease(Utc::now()) => {
                let owner = cycle.lease.map(|l| l.owner).unwrap_or_default();
                debug!(cycle_id = %id, %owner, "cycle owned by another process; leaving cancel request for it");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(cycle_id = %id, error = %e, "cancel request failed");
                return true;
            }
        }
        match operator::cancel(
            self.store.as_ref(),
            &self.journal,
            self.scheduler.chains(),
            &self.options.state_dir,
            &id,
            Utc::now(),
        ) {
            Ok(CancelResult::Cancelled(_)) => info!(cycle_id = %id, "cancelled idle cycle"),
            Ok(CancelResult::Forwarded { owner }) => {
                debug!(cycle_id = %id, %owner, "cycle owned by another process")
            }
            Err(e) => warn!(cycle_id = %id, error = %e, "cancel request failed"),
        }
        true
    }

    fn prune(&self) {
        if let Err(e) = operator::prune(
            self.store.as_ref(),
            &self.journal,
            self.options.retention,
            Utc::now(),
        ) {
            warn!(error = %e, "pruning failed");
        }
    }

    /// Interrupt every drive and wait for them to leave their records
    /// resumable.
    async fn shutdown(&mut self) {
        if self.drives.is_empty() {
            return;
        }
        info!(running = self.drives.len(), "stopping running cycles");
        for tx in self.interrupts.values() {
            let _ = tx.send(Some(Interrupt::Shutdown));
        }
        while let Some(joined) = self.drives.join_next().await {
            match joined {
                Ok((id, result)) => self.drive_finished(id, result),
                Err(e) => error!(error = %e, "cycle drive task panicked"),
            }
        }
    }
}
