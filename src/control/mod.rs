// src/control/mod.rs

//! Operator surface.
//!
//! Actions that only touch a record (`retry`, `ack`, `prune`, `status`,
//! `cancel` of an unowned cycle) go straight to the store with
//! compare-and-swap. Actions that need the running daemon (`poll`, `cancel`
//! of a cycle it is driving) are queued as request files it watches.

pub mod operator;
pub mod request;
pub mod watcher;

pub use operator::{CancelResult, StatusRow};
pub use request::ControlRequest;
pub use watcher::{ControlWatcher, spawn_control_watcher};
