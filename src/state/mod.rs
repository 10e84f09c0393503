// src/state/mod.rs

//! Durable cycle state.
//!
//! - [`cycle`]: the record itself and its id.
//! - [`store`]: the [`CycleStore`] contract (atomic save, compare-and-swap).
//! - [`file_store`]: one JSON file per cycle, used in production.
//! - [`memory_store`]: the same semantics in memory, used in tests.
//! - [`journal`]: append-only audit log of lifecycle events.

pub mod cycle;
pub mod file_store;
pub mod journal;
pub mod memory_store;
pub mod store;

pub use cycle::{Cycle, CycleId, CycleStatus, Lease, StageRecord, StageResult};
pub use file_store::FileCycleStore;
pub use journal::{Journal, JournalEntry, JournalEvent};
pub use memory_store::MemoryCycleStore;
pub use store::CycleStore;
