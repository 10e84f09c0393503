// src/exec/backend.rs

//! Pluggable stage runner abstraction.
//!
//! The orchestrator talks to a [`StageRunner`] instead of spawning processes
//! itself. Production uses [`ProcessStageRunner`](super::ProcessStageRunner);
//! tests provide a scripted runner that returns canned outcomes without
//! touching the OS.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::chain::{StageDescriptor, TemplateContext};
use crate::state::CycleId;

/// Classified result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    /// Exit code outside the accepted range (or -1 when the process could
    /// not be started or was killed by a signal).
    Failed { exit_code: i32, diagnostic: String },
    TimedOut,
    /// Exit code accepted but file/pattern evidence is missing.
    MarkersMissing { missing: Vec<String> },
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Success => "SUCCESS",
            StageOutcome::Failed { .. } => "FAILED",
            StageOutcome::TimedOut => "TIMED_OUT",
            StageOutcome::MarkersMissing { .. } => "MARKERS_MISSING",
        }
    }

    /// One-line description stored as the cycle's last diagnostic.
    pub fn diagnostic(&self) -> String {
        match self {
            StageOutcome::Success => "success".to_string(),
            StageOutcome::Failed {
                exit_code,
                diagnostic,
            } if diagnostic.is_empty() => format!("exit code {exit_code}"),
            StageOutcome::Failed {
                exit_code,
                diagnostic,
            } => format!("exit code {exit_code}: {diagnostic}"),
            StageOutcome::TimedOut => "timed out".to_string(),
            StageOutcome::MarkersMissing { missing } => {
                format!("markers missing: {}", missing.join(", "))
            }
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a running attempt was stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The process is shutting down; the cycle stays resumable.
    Shutdown,
    /// An operator cancelled the cycle.
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Finished(StageOutcome),
    Interrupted(Interrupt),
}

/// Per-attempt values the runner needs besides the descriptor.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub cycle_id: CycleId,
    pub chain: String,
    pub reference_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub workdir: PathBuf,
    /// 1-based launch number of this stage within the cycle.
    pub attempt: u32,
}

impl AttemptContext {
    pub fn template<'a>(&'a self, stage: &'a str) -> TemplateContext<'a> {
        TemplateContext {
            cycle_id: self.cycle_id.as_str(),
            chain: &self.chain,
            stage,
            reference_time: self.reference_time,
            end_time: self.end_time,
            workdir: &self.workdir,
            attempt: self.attempt,
        }
    }
}

pub type InterruptReceiver = watch::Receiver<Option<Interrupt>>;

/// Resolve once an interrupt is signalled. Never resolves if the sender is
/// dropped without signalling.
pub async fn wait_for_interrupt(rx: &mut InterruptReceiver) -> Interrupt {
    let seen = match rx.wait_for(Option::is_some).await {
        Ok(value) => *value,
        Err(_) => None,
    };
    match seen {
        Some(interrupt) => interrupt,
        None => std::future::pending().await,
    }
}

/// Executes exactly one attempt of one stage. No retry logic lives here.
pub trait StageRunner: Send + Sync + fmt::Debug {
    fn execute<'a>(
        &'a self,
        stage: &'a StageDescriptor,
        ctx: &'a AttemptContext,
        interrupt: InterruptReceiver,
    ) -> Pin<Box<dyn Future<Output = AttemptResult> + Send + 'a>>;
}
