// src/config/mod.rs

//! Configuration loading and validation for forecycle.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Parse human durations (`duration.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Compile it into chains and stage descriptors (`validate.rs`).

pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    ChainConfig, ConfigFile, ConfigSection, MarkerConfig, NotifyConfig, RawConfigFile, Settings,
    StageConfig,
};
pub use validate::validate_config;
