// src/state/memory_store.rs

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::errors::{ForecycleError, Result};
use crate::state::cycle::{Cycle, CycleId};
use crate::state::store::CycleStore;

/// In-process store with the same compare-and-swap semantics as
/// [`FileCycleStore`](crate::state::FileCycleStore), for tests.
#[derive(Debug, Default)]
pub struct MemoryCycleStore {
    records: Mutex<BTreeMap<CycleId, Cycle>>,
    fail_writes: AtomicBool,
}

impl MemoryCycleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create`/`save` fail with a store error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a record without the revision check (simulates another
    /// process writing).
    pub fn put(&self, cycle: Cycle) {
        self.records().insert(cycle.cycle_id.clone(), cycle);
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<CycleId, Cycle>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ForecycleError::StateStore("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl CycleStore for MemoryCycleStore {
    fn load(&self, id: &CycleId) -> Result<Option<Cycle>> {
        Ok(self.records().get(id).cloned())
    }

    fn create(&self, cycle: &Cycle) -> Result<bool> {
        self.check_writable()?;
        let mut records = self.records();
        if records.contains_key(&cycle.cycle_id) {
            return Ok(false);
        }
        records.insert(cycle.cycle_id.clone(), cycle.clone());
        Ok(true)
    }

    fn save(&self, cycle: &mut Cycle) -> Result<()> {
        self.check_writable()?;
        let mut records = self.records();
        let current = records
            .get(&cycle.cycle_id)
            .ok_or_else(|| ForecycleError::CycleNotFound(cycle.cycle_id.to_string()))?;
        if current.revision != cycle.revision {
            return Err(ForecycleError::StateConflict {
                cycle_id: cycle.cycle_id.to_string(),
            });
        }
        cycle.revision += 1;
        records.insert(cycle.cycle_id.clone(), cycle.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cycle>> {
        let mut cycles: Vec<Cycle> = self.records().values().cloned().collect();
        cycles.sort_by(|a, b| {
            a.reference_time
                .cmp(&b.reference_time)
                .then_with(|| a.cycle_id.cmp(&b.cycle_id))
        });
        Ok(cycles)
    }

    fn remove(&self, id: &CycleId) -> Result<()> {
        self.records().remove(id);
        Ok(())
    }
}
