// src/engine/scheduler.rs

//! Decides which cycles to (re)launch.
//!
//! `poll` is the only entry point and takes `now` and an explicit
//! [`SchedulerState`]; the durable truth lives in the [`CycleStore`]. Two
//! pollers racing on the same window both call `create`, and only one wins.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::chain::ChainSet;
use crate::errors::Result;
use crate::state::{Cycle, CycleId, CycleStore, Journal, JournalEvent};

/// Per-process scheduler memory, passed in rather than held globally.
#[derive(Debug, Clone, Default)]
pub struct SchedulerState {
    /// Cycles this process is currently driving.
    pub in_flight: BTreeSet<CycleId>,
    pub last_poll: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What one poll found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Records created by this poll.
    pub created: Vec<CycleId>,
    /// Active cycles with no live owner, oldest first (includes `created`).
    pub runnable: Vec<CycleId>,
    /// Due windows whose record could not be read or created.
    pub skipped: Vec<CycleId>,
}

#[derive(Debug)]
pub struct CycleScheduler {
    chains: ChainSet,
    store: Arc<dyn CycleStore>,
    journal: Arc<Journal>,
    work_root: PathBuf,
    retention: Duration,
}

impl CycleScheduler {
    pub fn new(
        chains: ChainSet,
        store: Arc<dyn CycleStore>,
        journal: Arc<Journal>,
        work_root: PathBuf,
        retention: Duration,
    ) -> Self {
        Self {
            chains,
            store,
            journal,
            work_root,
            retention,
        }
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    /// Cycle ids to (re)launch at `now`.
    pub fn poll(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Result<Vec<CycleId>> {
        Ok(self.poll_report(state, now)?.runnable)
    }

    pub fn poll_report(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Result<PollReport> {
        let mut report = PollReport::default();
        let floor = self.retention_floor(now);

        for chain in self.chains.iter() {
            for reference_time in chain.schedule().due_reference_times(now, floor) {
                let id = chain.cycle_id(reference_time);
                // A bad record holds back its own window, never the others.
                match self.store.load(&id) {
                    Ok(Some(existing)) => {
                        debug!(cycle_id = %id, status = %existing.status, "window already has a cycle");
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(cycle_id = %id, error = %e, "cannot read cycle record; skipping window");
                        report.skipped.push(id);
                        continue;
                    }
                }
                let cycle = Cycle::new_pending(chain, reference_time, &self.work_root, now);
                match self.store.create(&cycle) {
                    Ok(true) => {
                        info!(cycle_id = %id, "created cycle");
                        self.journal.record(&id, JournalEvent::Created, "");
                        report.created.push(id);
                    }
                    Ok(false) => debug!(cycle_id = %id, "another poller created this cycle first"),
                    Err(e) => {
                        error!(cycle_id = %id, error = %e, "cannot create cycle record; skipping window");
                        report.skipped.push(id);
                    }
                }
            }
        }

        for cycle in self.store.list_active()? {
            if state.in_flight.contains(&cycle.cycle_id) {
                continue;
            }
            if cycle.has_live_lease(now) {
                continue;
            }
            if cycle.lease.is_some() {
                warn!(
                    cycle_id = %cycle.cycle_id,
                    status = %cycle.status,
                    silent_secs = cycle.silent_for(now).num_seconds(),
                    "stale cycle: lease expired; handing back for resumption"
                );
            }
            report.runnable.push(cycle.cycle_id);
        }

        state.last_poll = Some(now);
        Ok(report)
    }

    /// Oldest reference time the scheduler will still create.
    fn retention_floor(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        TimeDelta::from_std(self.retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
    }
}
