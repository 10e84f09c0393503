// src/exec/mod.rs

//! Stage execution layer.
//!
//! Runs exactly one attempt of one stage and reports a classified outcome.
//! Retry policy is the orchestrator's business, not this module's.
//!
//! - [`backend`] defines the [`StageRunner`] trait, outcomes and the
//!   interrupt channel.
//! - [`process`] is the production runner using `tokio::process`.
//! - [`artifacts`] names and writes the per-attempt log and summary files.

pub mod artifacts;
pub mod backend;
pub mod process;

pub use artifacts::{AttemptArtifacts, AttemptSummary};
pub use backend::{
    AttemptContext, AttemptResult, Interrupt, InterruptReceiver, StageOutcome, StageRunner,
    wait_for_interrupt,
};
pub use process::ProcessStageRunner;
