// src/engine/machine.rs

//! Pure per-cycle state machine.
//!
//! No IO and no clock reads: every function takes `now` and mutates a
//! [`Cycle`] in place. The orchestrator persists the record after each
//! call and only then performs the side effect the new state asks for.
//!
//! ```text
//! PENDING ──launch──► RUNNING ──success, more stages──► RUNNING (index+1)
//!                       │   └──success, last stage────► SUCCEEDED
//!                       └──failure──► STAGE_FAILED ──retries left──► RETRYING
//!                                          │                          │ backoff
//!                                          └──exhausted──► FAILED_TERMINAL
//!                                                   RUNNING ◄─────────┘
//! ```

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::chain::RetryPolicy;
use crate::exec::StageOutcome;
use crate::state::{Cycle, CycleStatus, StageRecord, StageResult};

/// What the driver has to do next for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Launch the current stage.
    Launch,
    /// Wait until `retry_at`, then call [`begin_retry`].
    WaitRetry { until: DateTime<Utc> },
    /// A failure is recorded but not yet classified; call [`resolve_failure`].
    Resolve,
    Done,
}

/// Result of applying an outcome or resolving a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced { next_stage: usize },
    Succeeded,
    StageFailed,
    Retrying { delay: Duration },
    FailedTerminal,
}

pub fn next_step(cycle: &Cycle) -> Step {
    match cycle.status {
        CycleStatus::Pending | CycleStatus::Running => Step::Launch,
        CycleStatus::Retrying => Step::WaitRetry {
            until: cycle.retry_at.unwrap_or(cycle.updated_at),
        },
        CycleStatus::StageFailed => Step::Resolve,
        CycleStatus::Succeeded | CycleStatus::FailedTerminal => Step::Done,
    }
}

/// Mark the current stage as launched. Returns the launch number used to
/// name this attempt's artifacts.
pub fn begin_attempt(cycle: &mut Cycle, now: DateTime<Utc>) -> u32 {
    cycle.status = CycleStatus::Running;
    cycle.started_at.get_or_insert(now);
    cycle.stage_started_at.get_or_insert(now);
    cycle.retry_at = None;
    cycle.launch_count += 1;
    cycle.updated_at = now;
    cycle.launch_count
}

/// Apply the outcome of an attempt of the current stage.
pub fn record_outcome(
    cycle: &mut Cycle,
    stage_name: &str,
    is_last_stage: bool,
    outcome: &StageOutcome,
    now: DateTime<Utc>,
) -> Transition {
    if outcome.is_success() {
        return complete_stage(cycle, stage_name, is_last_stage, StageResult::Succeeded, now);
    }
    cycle.status = CycleStatus::StageFailed;
    cycle.last_diagnostic = Some(format!("{stage_name}: {}", outcome.diagnostic()));
    cycle.updated_at = now;
    Transition::StageFailed
}

/// The current stage turned out to be complete without a new launch.
pub fn record_recovered(
    cycle: &mut Cycle,
    stage_name: &str,
    is_last_stage: bool,
    now: DateTime<Utc>,
) -> Transition {
    complete_stage(cycle, stage_name, is_last_stage, StageResult::Recovered, now)
}

fn complete_stage(
    cycle: &mut Cycle,
    stage_name: &str,
    is_last_stage: bool,
    result: StageResult,
    now: DateTime<Utc>,
) -> Transition {
    push_history(cycle, stage_name, result, None, now);
    cycle.updated_at = now;

    if is_last_stage {
        cycle.status = CycleStatus::Succeeded;
        cycle.finished_at = Some(now);
        cycle.last_diagnostic = None;
        return Transition::Succeeded;
    }

    cycle.status = CycleStatus::Running;
    cycle.current_stage_index += 1;
    cycle.attempt_count = 0;
    cycle.launch_count = 0;
    cycle.stage_started_at = None;
    Transition::Advanced {
        next_stage: cycle.current_stage_index,
    }
}

/// Decide between another attempt and giving up.
pub fn resolve_failure(
    cycle: &mut Cycle,
    stage_name: &str,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Transition {
    cycle.updated_at = now;

    if policy.allows_retry(cycle.attempt_count) {
        let delay = policy.backoff.delay_for(cycle.attempt_count);
        let until = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        cycle.status = CycleStatus::Retrying;
        cycle.retry_at = Some(until);
        return Transition::Retrying { delay };
    }

    let diagnostic = cycle.last_diagnostic.clone();
    push_history(cycle, stage_name, StageResult::Failed, diagnostic, now);
    cycle.status = CycleStatus::FailedTerminal;
    cycle.retry_at = None;
    cycle.finished_at = Some(now);
    Transition::FailedTerminal
}

/// Backoff elapsed: move back to RUNNING for the next attempt.
pub fn begin_retry(cycle: &mut Cycle, now: DateTime<Utc>) {
    cycle.status = CycleStatus::Running;
    cycle.attempt_count += 1;
    cycle.retry_at = None;
    cycle.updated_at = now;
}

/// Operator abort. Partial output stays on disk.
pub fn cancel(cycle: &mut Cycle, stage_name: Option<&str>, now: DateTime<Utc>) {
    let diagnostic = "cancelled by operator".to_string();
    if let Some(stage) = stage_name {
        push_history(cycle, stage, StageResult::Cancelled, Some(diagnostic.clone()), now);
    }
    cycle.status = CycleStatus::FailedTerminal;
    cycle.last_diagnostic = Some(diagnostic);
    cycle.retry_at = None;
    cycle.finished_at = Some(now);
    cycle.updated_at = now;
}

/// Operator re-trigger of a FAILED_TERMINAL cycle: restart the failed stage
/// from a clean retry budget. Earlier history is kept, and `launch_count`
/// keeps counting so new attempts never reuse an artifact name.
pub fn reset_for_retry(cycle: &mut Cycle, now: DateTime<Utc>) {
    cycle.status = CycleStatus::Pending;
    cycle.attempt_count = 0;
    cycle.retry_at = None;
    cycle.finished_at = None;
    cycle.stage_started_at = None;
    cycle.acknowledged_at = None;
    cycle.last_diagnostic = None;
    cycle.updated_at = now;
}

fn push_history(
    cycle: &mut Cycle,
    stage_name: &str,
    result: StageResult,
    diagnostic: Option<String>,
    now: DateTime<Utc>,
) {
    cycle.history.push(StageRecord {
        stage: stage_name.to_string(),
        attempts: cycle.attempt_count + 1,
        result,
        started_at: cycle.stage_started_at,
        finished_at: now,
        diagnostic,
    });
}
