// src/state/store.rs

use std::fmt::Debug;

use crate::errors::{ForecycleError, Result};
use crate::state::cycle::{Cycle, CycleId};

/// Durable mapping from [`CycleId`] to [`Cycle`].
///
/// Implementations must make `save` atomic and must reject a save whose
/// `revision` no longer matches the stored record
/// ([`ForecycleError::StateConflict`]). That check is what keeps two
/// processes from driving the same cycle.
pub trait CycleStore: Send + Sync + Debug {
    fn load(&self, id: &CycleId) -> Result<Option<Cycle>>;

    /// Insert `cycle` unless a record with the same id exists. Returns
    /// whether this call created it.
    fn create(&self, cycle: &Cycle) -> Result<bool>;

    /// Compare-and-swap on `cycle.revision`. On success the stored record
    /// equals `cycle` and `cycle.revision` has been incremented.
    fn save(&self, cycle: &mut Cycle) -> Result<()>;

    /// Every readable record, oldest reference time first.
    fn list(&self) -> Result<Vec<Cycle>>;

    fn remove(&self, id: &CycleId) -> Result<()>;

    /// Records that still need driving.
    fn list_active(&self) -> Result<Vec<Cycle>> {
        Ok(self.list()?.into_iter().filter(Cycle::is_active).collect())
    }

    fn load_required(&self, id: &CycleId) -> Result<Cycle> {
        self.load(id)?
            .ok_or_else(|| ForecycleError::CycleNotFound(id.to_string()))
    }
}
