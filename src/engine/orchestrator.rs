// src/engine/orchestrator.rs

//! Drives one cycle through its stage chain.
//!
//! The decisions live in [`machine`](super::machine); this is the IO shell
//! around them: lease claims, persistence, the runner and notifications.
//! Every transition is saved before the next process is launched, so a crash
//! loses at most the result of the stage that was running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::chain::{Chain, ChainSet, MarkerInputs, StageDescriptor};
use crate::engine::machine::{self, Step, Transition};
use crate::engine::notify::Notifier;
use crate::errors::{ForecycleError, Result};
use crate::exec::{
    AttemptArtifacts, AttemptContext, AttemptResult, AttemptSummary, Interrupt, InterruptReceiver,
    StageOutcome, StageRunner, wait_for_interrupt,
};
use crate::fs::FileSystem;
use crate::state::{Cycle, CycleId, CycleStatus, CycleStore, Journal, JournalEvent, Lease};

/// Knobs the orchestrator needs from `[config]`.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Lease owner written into records this process drives.
    pub owner: String,
    pub work_root: PathBuf,
    /// Lease lifetime; a cycle whose lease is older is presumed abandoned.
    pub lease_ttl: Duration,
}

impl OrchestratorOptions {
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(100))
    }
}

/// How a call to [`Orchestrator::drive`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The cycle reached a terminal status.
    Finished(CycleStatus),
    /// Shutdown: the record was left resumable and the lease released.
    Interrupted,
    /// Terminal already, leased by someone else, or unknown chain.
    Skipped,
    /// Ownership was lost mid-drive to another process.
    LeaseLost,
}

#[derive(Debug)]
pub struct Orchestrator {
    chains: ChainSet,
    store: Arc<dyn CycleStore>,
    runner: Arc<dyn StageRunner>,
    fs: Arc<dyn FileSystem>,
    journal: Arc<Journal>,
    notifier: Notifier,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        chains: ChainSet,
        store: Arc<dyn CycleStore>,
        runner: Arc<dyn StageRunner>,
        fs: Arc<dyn FileSystem>,
        journal: Arc<Journal>,
        options: OrchestratorOptions,
    ) -> Self {
        let notifier = Notifier::new(fs.clone(), journal.clone());
        Self {
            chains,
            store,
            runner,
            fs,
            journal,
            notifier,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn CycleStore> {
        &self.store
    }

    /// Drive `id` until it is terminal, interrupted, or ownership is lost.
    ///
    /// Stage failures are absorbed by the retry policy and never surface as
    /// `Err`; store failures do, and leave the record as last saved.
    pub async fn drive(&self, id: &CycleId, mut interrupt: InterruptReceiver) -> Result<DriveOutcome> {
        let Some(mut cycle) = self.claim(id)? else {
            return Ok(DriveOutcome::Skipped);
        };
        let Some(chain) = self.chains.get(&cycle.chain).cloned() else {
            warn!(cycle_id = %id, chain = %cycle.chain, "cycle belongs to an unknown chain; leaving it alone");
            self.release(&mut cycle)?;
            return Ok(DriveOutcome::Skipped);
        };

        info!(cycle_id = %id, status = %cycle.status, stage_index = cycle.current_stage_index, "driving cycle");

        if cycle.status == CycleStatus::Running && cycle.launch_count > 0 {
            if let Some(outcome) = self.recover_interrupted_stage(&chain, &mut cycle).await? {
                return Ok(outcome);
            }
        }

        loop {
            let pending = *interrupt.borrow();
            if let Some(reason) = pending {
                return self.handle_interrupt(&chain, &mut cycle, reason).await;
            }

            match machine::next_step(&cycle) {
                Step::Done => {
                    self.release(&mut cycle)?;
                    return Ok(DriveOutcome::Finished(cycle.status));
                }

                Step::Resolve => {
                    let stage = self.current_stage(&chain, &cycle)?;
                    let transition =
                        machine::resolve_failure(&mut cycle, &stage.name, &stage.retry, Utc::now());
                    if let Some(outcome) = self.commit(&chain, &mut cycle, &stage, transition).await? {
                        return Ok(outcome);
                    }
                }

                Step::WaitRetry { until } => {
                    let remaining = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(cycle_id = %id, wait_ms = remaining.as_millis() as u64, "waiting out retry backoff");
                    let sleep = tokio::time::sleep(remaining);
                    match self.hold(&mut cycle, Some(&mut interrupt), sleep).await? {
                        Held::Done(()) => machine::begin_retry(&mut cycle, Utc::now()),
                        Held::Interrupted(reason) => {
                            return self.handle_interrupt(&chain, &mut cycle, reason).await;
                        }
                        Held::Lost => return Ok(DriveOutcome::LeaseLost),
                    }
                }

                Step::Launch => {
                    let stage = self.current_stage(&chain, &cycle)?;
                    let attempt = machine::begin_attempt(&mut cycle, Utc::now());
                    if !self.persist(&mut cycle)? {
                        return Ok(DriveOutcome::LeaseLost);
                    }

                    let ctx = AttemptContext {
                        cycle_id: cycle.cycle_id.clone(),
                        chain: chain.name().to_string(),
                        reference_time: cycle.reference_time,
                        end_time: chain.end_time(cycle.reference_time),
                        workdir: cycle.working_directory.clone(),
                        attempt,
                    };
                    let execution = self.runner.execute(&stage, &ctx, interrupt.clone());
                    // The runner watches the interrupt itself so it can kill
                    // the process and close its artifacts.
                    let result = match self.hold(&mut cycle, None, execution).await? {
                        Held::Done(result) => result,
                        Held::Interrupted(reason) => AttemptResult::Interrupted(reason),
                        Held::Lost => return Ok(DriveOutcome::LeaseLost),
                    };

                    match result {
                        AttemptResult::Interrupted(reason) => {
                            return self.handle_interrupt(&chain, &mut cycle, reason).await;
                        }
                        AttemptResult::Finished(outcome) => {
                            self.log_outcome(&cycle, &stage, attempt, &outcome);
                            let is_last = chain.is_last(cycle.current_stage_index);
                            let transition = machine::record_outcome(
                                &mut cycle,
                                &stage.name,
                                is_last,
                                &outcome,
                                Utc::now(),
                            );
                            if let Some(outcome) =
                                self.commit(&chain, &mut cycle, &stage, transition).await?
                            {
                                return Ok(outcome);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Load and lease a cycle. `None` when it is terminal or someone else
    /// holds a live lease.
    fn claim(&self, id: &CycleId) -> Result<Option<Cycle>> {
        let mut cycle = self.store.load_required(id)?;
        let now = Utc::now();
        if cycle.is_terminal() {
            debug!(cycle_id = %id, status = %cycle.status, "cycle already terminal");
            return Ok(None);
        }
        if let Some(lease) = cycle.lease.as_ref().filter(|l| l.is_live(now)) {
            if lease.owner != self.options.owner {
                debug!(cycle_id = %id, owner = %lease.owner, "cycle leased by another owner");
                return Ok(None);
            }
        }
        if cycle.has_live_lease(now) {
            debug!(cycle_id = %id, "renewing our own lease");
        } else if cycle.status != CycleStatus::Pending {
            warn!(
                cycle_id = %id,
                status = %cycle.status,
                silent_secs = cycle.silent_for(now).num_seconds(),
                "resuming abandoned cycle"
            );
        }

        cycle.lease = Some(self.fresh_lease());
        cycle.updated_at = now;
        match self.store.save(&mut cycle) {
            Ok(()) => Ok(Some(cycle)),
            Err(e) if e.is_conflict() => {
                debug!(cycle_id = %id, "lost the race to claim cycle");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn fresh_lease(&self) -> Lease {
        let ttl = TimeDelta::from_std(self.options.lease_ttl).unwrap_or(TimeDelta::MAX);
        Lease {
            owner: self.options.owner.clone(),
            expires_at: Utc::now()
                .checked_add_signed(ttl)
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
        }
    }

    fn current_stage(&self, chain: &Chain, cycle: &Cycle) -> Result<Arc<StageDescriptor>> {
        chain.stage(cycle.current_stage_index).cloned().ok_or_else(|| {
            ForecycleError::StateStore(format!(
                "cycle '{}' points at stage {} but chain '{}' has {} stages",
                cycle.cycle_id,
                cycle.current_stage_index,
                chain.name(),
                chain.len()
            ))
        })
    }

    /// The stage was launched before the last stop but its result was never
    /// recorded. The attempt summary decides when the runner got to write
    /// one: only `SUCCESS` counts as done. A stage that died without a
    /// summary is done if its evidence markers hold.
    async fn recover_interrupted_stage(
        &self,
        chain: &Chain,
        cycle: &mut Cycle,
    ) -> Result<Option<DriveOutcome>> {
        let stage = self.current_stage(chain, cycle)?;
        let artifacts = AttemptArtifacts::new(&cycle.working_directory, &stage.name, cycle.launch_count);
        let summary_path = artifacts.summary_path();

        let completed = if self.fs.exists(&summary_path) {
            match AttemptSummary::load(self.fs.as_ref(), &summary_path) {
                Ok(summary) if summary.outcome == StageOutcome::Success.label() => true,
                Ok(summary) => {
                    debug!(cycle_id = %cycle.cycle_id, stage = %stage.name, outcome = %summary.outcome, "last attempt did not succeed; relaunching");
                    false
                }
                Err(e) => {
                    warn!(cycle_id = %cycle.cycle_id, path = %summary_path.display(), error = %e, "unreadable attempt summary; checking evidence");
                    self.evidence_holds(cycle, &stage, &artifacts)
                }
            }
        } else {
            self.evidence_holds(cycle, &stage, &artifacts)
        };
        if !completed {
            return Ok(None);
        }

        info!(cycle_id = %cycle.cycle_id, stage = %stage.name, "interrupted stage already complete; skipping relaunch");
        self.journal.record(&cycle.cycle_id, JournalEvent::StageRecovered, &stage.name);
        let is_last = chain.is_last(cycle.current_stage_index);
        let transition = machine::record_recovered(cycle, &stage.name, is_last, Utc::now());
        self.commit(chain, cycle, &stage, transition).await
    }

    fn evidence_holds(&self, cycle: &Cycle, stage: &StageDescriptor, artifacts: &AttemptArtifacts) -> bool {
        if !stage.markers.has_evidence() {
            return false;
        }
        let stdout_log = artifacts.stdout_log();
        let stderr_log = artifacts.stderr_log();
        let report = stage.markers.check_evidence(
            self.fs.as_ref(),
            MarkerInputs {
                workdir: &cycle.working_directory,
                stdout_log: Some(&stdout_log),
                stderr_log: Some(&stderr_log),
            },
        );
        if !report.satisfied() {
            debug!(cycle_id = %cycle.cycle_id, stage = %stage.name, missing = ?report.missing, "interrupted stage incomplete; relaunching");
        }
        report.satisfied()
    }

    /// Persist a transition and react to it. `Some` ends the drive.
    async fn commit(
        &self,
        chain: &Chain,
        cycle: &mut Cycle,
        stage: &StageDescriptor,
        transition: Transition,
    ) -> Result<Option<DriveOutcome>> {
        if cycle.is_terminal() {
            cycle.lease = None;
        }
        if !self.persist(cycle)? {
            return Ok(Some(DriveOutcome::LeaseLost));
        }

        match transition {
            Transition::Advanced { next_stage } => {
                self.journal.record(&cycle.cycle_id, JournalEvent::StageSucceeded, &stage.name);
                debug!(cycle_id = %cycle.cycle_id, next_stage, "advanced to next stage");
                Ok(None)
            }
            Transition::StageFailed => {
                let detail = cycle.last_diagnostic.clone().unwrap_or_default();
                self.journal.record(&cycle.cycle_id, JournalEvent::StageFailed, &detail);
                Ok(None)
            }
            Transition::Retrying { delay } => {
                info!(
                    cycle_id = %cycle.cycle_id,
                    stage = %stage.name,
                    retry = cycle.attempt_count + 1,
                    max_retries = stage.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling retry"
                );
                Ok(None)
            }
            Transition::Succeeded => {
                self.journal.record(&cycle.cycle_id, JournalEvent::StageSucceeded, &stage.name);
                self.journal.record(&cycle.cycle_id, JournalEvent::Succeeded, "");
                info!(cycle_id = %cycle.cycle_id, "cycle succeeded");
                self.notifier.cycle_finished(chain, cycle).await;
                Ok(Some(DriveOutcome::Finished(CycleStatus::Succeeded)))
            }
            Transition::FailedTerminal => {
                let err = ForecycleError::ExhaustedRetries {
                    cycle_id: cycle.cycle_id.to_string(),
                    stage: stage.name.clone(),
                };
                let detail = cycle.last_diagnostic.clone().unwrap_or_default();
                error!(cycle_id = %cycle.cycle_id, diagnostic = %detail, "{err}");
                self.journal.record(&cycle.cycle_id, JournalEvent::FailedTerminal, &detail);
                self.notifier.cycle_finished(chain, cycle).await;
                Ok(Some(DriveOutcome::Finished(CycleStatus::FailedTerminal)))
            }
        }
    }

    async fn handle_interrupt(
        &self,
        chain: &Chain,
        cycle: &mut Cycle,
        reason: Interrupt,
    ) -> Result<DriveOutcome> {
        match reason {
            Interrupt::Shutdown => {
                info!(cycle_id = %cycle.cycle_id, status = %cycle.status, "shutdown: leaving cycle resumable");
                self.release(cycle)?;
                Ok(DriveOutcome::Interrupted)
            }
            Interrupt::Cancel => {
                let stage = chain
                    .stage(cycle.current_stage_index)
                    .map(|s| s.name.clone());
                machine::cancel(cycle, stage.as_deref(), Utc::now());
                cycle.lease = None;
                if !self.persist(cycle)? {
                    return Ok(DriveOutcome::LeaseLost);
                }
                warn!(cycle_id = %cycle.cycle_id, "cycle cancelled by operator");
                self.journal.record(
                    &cycle.cycle_id,
                    JournalEvent::Cancelled,
                    stage.as_deref().unwrap_or_default(),
                );
                self.notifier.cycle_finished(chain, cycle).await;
                Ok(DriveOutcome::Finished(CycleStatus::FailedTerminal))
            }
        }
    }

    /// Drop our lease so another process may pick the cycle up at once.
    fn release(&self, cycle: &mut Cycle) -> Result<()> {
        if cycle.lease.is_none() {
            return Ok(());
        }
        cycle.lease = None;
        cycle.updated_at = Utc::now();
        self.persist(cycle).map(|_| ())
    }

    /// Save with compare-and-swap. On a conflict, re-read: if we still own
    /// the record, take its revision and save again; otherwise report the
    /// lease as lost (`Ok(false)`).
    fn persist(&self, cycle: &mut Cycle) -> Result<bool> {
        match self.store.save(cycle) {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                let current = self.store.load_required(&cycle.cycle_id)?;
                if current.leased_by(&self.options.owner, Utc::now()) {
                    warn!(cycle_id = %cycle.cycle_id, "record changed under our lease; overwriting");
                    cycle.revision = current.revision;
                    self.store.save(cycle)?;
                    Ok(true)
                } else {
                    let owner = current
                        .lease
                        .map(|l| l.owner)
                        .unwrap_or_else(|| "nobody".to_string());
                    error!(cycle_id = %cycle.cycle_id, %owner, "lost ownership of cycle; halting");
                    Ok(false)
                }
            }
            Err(e) => {
                error!(cycle_id = %cycle.cycle_id, error = %e, "state store failure; halting cycle");
                Err(e)
            }
        }
    }

    /// Await `fut` while keeping the lease alive and, when given, watching
    /// for interrupts.
    async fn hold<F, T>(
        &self,
        cycle: &mut Cycle,
        interrupt: Option<&mut InterruptReceiver>,
        fut: F,
    ) -> Result<Held<T>>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::pin!(fut);
        let interrupted = async move {
            match interrupt {
                Some(rx) => wait_for_interrupt(rx).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(interrupted);
        let period = self.options.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                value = &mut fut => return Ok(Held::Done(value)),
                _ = heartbeat.tick() => {
                    cycle.lease = Some(self.fresh_lease());
                    cycle.updated_at = Utc::now();
                    if !self.persist(cycle)? {
                        return Ok(Held::Lost);
                    }
                    debug!(cycle_id = %cycle.cycle_id, "heartbeat");
                }
                reason = &mut interrupted => {
                    return Ok(Held::Interrupted(reason));
                }
            }
        }
    }

    fn log_outcome(&self, cycle: &Cycle, stage: &StageDescriptor, attempt: u32, outcome: &StageOutcome) {
        if outcome.is_success() {
            info!(cycle_id = %cycle.cycle_id, stage = %stage.name, attempt, "stage succeeded");
        } else {
            warn!(
                cycle_id = %cycle.cycle_id,
                stage = %stage.name,
                attempt,
                outcome = %outcome,
                diagnostic = %outcome.diagnostic(),
                "stage attempt failed"
            );
        }
    }
}

enum Held<T> {
    Done(T),
    Interrupted(Interrupt),
    Lost,
}
