// src/errors.rs

//! Crate-wide error type and helpers.
//!
//! Stage failures are *not* errors: they are reported as
//! [`StageOutcome`](crate::exec::StageOutcome) values and absorbed by the
//! orchestrator's retry state machine. Everything here escalates.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecycleError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("Cycle record '{cycle_id}' changed on disk since it was loaded")]
    StateConflict { cycle_id: String },

    #[error("Cycle not found: {0}")]
    CycleNotFound(String),

    #[error("Cycle '{cycle_id}' is leased by '{owner}'")]
    LeaseHeld { cycle_id: String, owner: String },

    #[error("Cycle '{cycle_id}' is {status}; cannot {action}")]
    InvalidTransition {
        cycle_id: String,
        status: String,
        action: String,
    },

    #[error("Cycle '{cycle_id}' exhausted retries at stage '{stage}'")]
    ExhaustedRetries { cycle_id: String, stage: String },

    #[error("Stage execution error: {0}")]
    StageExecution(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForecycleError {
    /// Process exit code for an error that escaped to `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            ForecycleError::ConfigError(_) | ForecycleError::TomlError(_) => 2,
            _ => 1,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ForecycleError::StateConflict { .. })
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ForecycleError>;
