// src/engine/mod.rs

//! Orchestration engine for forecycle.
//!
//! This module ties together:
//! - the cycle scheduler (which windows are due, which cycles are stale)
//! - the per-cycle state machine and the orchestrator that drives it
//! - best-effort downstream notification
//! - the daemon loop that reacts to:
//!   - poll timer ticks
//!   - operator control requests
//!   - finished cycle drives
//!   - shutdown signals
//!
//! The pure state machine lives in [`machine`]; the async/IO shell around
//! it is [`orchestrator`], and [`runtime`] runs many of those at once.

/// Events flowing into the runtime from signal handlers and the control
/// watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Poll for due cycles immediately.
    PollRequested,
    /// New request files are waiting in the control directory.
    ControlPending,
    /// Graceful shutdown requested (e.g. Ctrl-C).
    ShutdownRequested,
}

pub mod machine;
pub mod notify;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;

pub use notify::Notifier;
pub use orchestrator::{DriveOutcome, Orchestrator, OrchestratorOptions};
pub use runtime::{Runtime, RuntimeOptions};
pub use scheduler::{CycleScheduler, PollReport, SchedulerState};
