// src/control/operator.rs

//! Operator actions applied straight to the store.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

use crate::chain::ChainSet;
use crate::control::request::{self, ControlRequest};
use crate::engine::machine;
use crate::errors::{ForecycleError, Result};
use crate::state::{Cycle, CycleId, CycleStatus, CycleStore, Journal, JournalEvent};

fn invalid(cycle: &Cycle, action: &str) -> ForecycleError {
    ForecycleError::InvalidTransition {
        cycle_id: cycle.cycle_id.to_string(),
        status: cycle.status.to_string(),
        action: action.to_string(),
    }
}

/// Re-trigger a FAILED_TERMINAL cycle. The daemon picks it up at its next
/// poll.
pub fn force_retry(
    store: &dyn CycleStore,
    journal: &Journal,
    id: &CycleId,
    now: DateTime<Utc>,
) -> Result<Cycle> {
    let mut cycle = store.load_required(id)?;
    if cycle.status != CycleStatus::FailedTerminal {
        return Err(invalid(&cycle, "retry"));
    }
    machine::reset_for_retry(&mut cycle, now);
    cycle.lease = None;
    store.save(&mut cycle)?;
    info!(cycle_id = %id, stage_index = cycle.current_stage_index, "cycle re-triggered by operator");
    journal.record(id, JournalEvent::Retried, "operator");
    Ok(cycle)
}

/// Mark a FAILED_TERMINAL cycle as seen, hiding it from default status.
pub fn acknowledge(
    store: &dyn CycleStore,
    journal: &Journal,
    id: &CycleId,
    now: DateTime<Utc>,
) -> Result<Cycle> {
    let mut cycle = store.load_required(id)?;
    if cycle.status != CycleStatus::FailedTerminal {
        return Err(invalid(&cycle, "acknowledge"));
    }
    if cycle.acknowledged_at.is_none() {
        cycle.acknowledged_at = Some(now);
        store.save(&mut cycle)?;
        journal.record(id, JournalEvent::Acknowledged, "operator");
    }
    Ok(cycle)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelResult {
    /// Nobody was driving it; the record is FAILED_TERMINAL now.
    Cancelled(Cycle),
    /// A live process owns it; a request was queued for that daemon.
    Forwarded { owner: String },
}

pub fn cancel(
    store: &dyn CycleStore,
    journal: &Journal,
    chains: &ChainSet,
    state_dir: &Path,
    id: &CycleId,
    now: DateTime<Utc>,
) -> Result<CancelResult> {
    let mut cycle = store.load_required(id)?;
    if cycle.is_terminal() {
        return Err(invalid(&cycle, "cancel"));
    }
    if let Some(lease) = cycle.lease.as_ref().filter(|l| l.is_live(now)) {
        let owner = lease.owner.clone();
        request::submit(
            state_dir,
            &ControlRequest::Cancel {
                cycle_id: id.clone(),
            },
        )?;
        info!(cycle_id = %id, %owner, "cancel forwarded to owning process");
        return Ok(CancelResult::Forwarded { owner });
    }

    let stage = chains
        .get(&cycle.chain)
        .and_then(|c| c.stage(cycle.current_stage_index))
        .map(|s| s.name.clone());
    machine::cancel(&mut cycle, stage.as_deref(), now);
    cycle.lease = None;
    store.save(&mut cycle)?;
    journal.record(id, JournalEvent::Cancelled, stage.as_deref().unwrap_or_default());
    Ok(CancelResult::Cancelled(cycle))
}

/// Remove terminal records whose reference time is older than `retention`.
/// Working directories are left alone.
pub fn prune(
    store: &dyn CycleStore,
    journal: &Journal,
    retention: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<CycleId>> {
    let Some(cutoff) = TimeDelta::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
    else {
        return Ok(Vec::new());
    };

    let mut pruned = Vec::new();
    for cycle in store.list()? {
        if cycle.is_terminal() && cycle.reference_time < cutoff {
            store.remove(&cycle.cycle_id)?;
            journal.record(&cycle.cycle_id, JournalEvent::Pruned, cycle.status.as_str());
            pruned.push(cycle.cycle_id);
        }
    }
    if !pruned.is_empty() {
        info!(count = pruned.len(), "pruned expired cycle records");
    }
    Ok(pruned)
}

/// One line of `forecycle status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRow {
    pub cycle_id: String,
    pub chain: String,
    pub reference_time: DateTime<Utc>,
    pub status: CycleStatus,
    pub stage: Option<String>,
    pub attempt_count: u32,
    pub updated_at: DateTime<Utc>,
    pub owner: Option<String>,
    pub stale: bool,
    pub acknowledged: bool,
    pub last_diagnostic: Option<String>,
}

/// Rows for active cycles, unacknowledged failures and the latest finished
/// cycle of each chain. `all` lists every record.
pub fn status(
    store: &dyn CycleStore,
    chains: &ChainSet,
    all: bool,
    now: DateTime<Utc>,
) -> Result<Vec<StatusRow>> {
    let cycles = store.list()?;

    let latest_terminal: Vec<&CycleId> = chains
        .iter()
        .filter_map(|chain| {
            cycles
                .iter()
                .filter(|c| c.chain == chain.name() && c.is_terminal())
                .max_by_key(|c| c.reference_time)
                .map(|c| &c.cycle_id)
        })
        .collect();

    let rows = cycles
        .iter()
        .filter(|c| {
            all || c.is_active()
                || (c.status == CycleStatus::FailedTerminal && c.acknowledged_at.is_none())
                || latest_terminal.contains(&&c.cycle_id)
        })
        .map(|c| StatusRow {
            cycle_id: c.cycle_id.to_string(),
            chain: c.chain.clone(),
            reference_time: c.reference_time,
            status: c.status,
            stage: chains
                .get(&c.chain)
                .and_then(|chain| chain.stage(c.current_stage_index))
                .map(|s| s.name.clone()),
            attempt_count: c.attempt_count,
            updated_at: c.updated_at,
            owner: c.lease.as_ref().map(|l| l.owner.clone()),
            stale: c.is_stale(now) && c.lease.is_some(),
            acknowledged: c.acknowledged_at.is_some(),
            last_diagnostic: c.last_diagnostic.clone(),
        })
        .collect();
    Ok(rows)
}

/// Plain-text table for `status`.
pub fn render_status(rows: &[StatusRow]) -> String {
    if rows.is_empty() {
        return "no cycles\n".to_string();
    }
    let mut out = format!(
        "{:<32} {:<16} {:<14} {:>7}  {}\n",
        "CYCLE", "STATUS", "STAGE", "RETRIES", "NOTE"
    );
    for row in rows {
        let mut note = row.last_diagnostic.clone().unwrap_or_default();
        if row.stale {
            note = format!("stale lease ({}) {note}", row.owner.as_deref().unwrap_or("?"));
        } else if let Some(owner) = &row.owner {
            note = format!("owner {owner} {note}");
        }
        if row.acknowledged {
            note = format!("[ack] {note}");
        }
        out.push_str(&format!(
            "{:<32} {:<16} {:<14} {:>7}  {}\n",
            row.cycle_id,
            row.status.as_str(),
            row.stage.as_deref().unwrap_or("-"),
            row.attempt_count,
            note.trim()
        ));
    }
    out
}
