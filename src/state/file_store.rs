// src/state/file_store.rs

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, error};

use crate::errors::{ForecycleError, Result};
use crate::state::cycle::{Cycle, CycleId};
use crate::state::store::CycleStore;

const LOCK_FILE: &str = ".lock";

/// One JSON file per cycle under `<state_dir>/cycles/`.
///
/// Writes go to a temp file that is fsynced and then renamed over the
/// record, so a crash leaves either the old or the new record. Creation uses
/// `hard_link`, which fails if the target exists, so two pollers racing on
/// the same window create exactly one record. Saves take an exclusive
/// `flock` on `cycles/.lock` around the revision check.
#[derive(Debug, Clone)]
pub struct FileCycleStore {
    root: PathBuf,
}

impl FileCycleStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        let root = state_dir.join("cycles");
        fs::create_dir_all(&root).map_err(|e| store_err(&root, "creating", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &CycleId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn temp_path(&self, id: &CycleId) -> PathBuf {
        self.root.join(format!(
            ".{id}.json.tmp.{}.{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    fn read_record(&self, path: &Path) -> Result<Option<Cycle>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(path, "reading", e)),
        };
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            ForecycleError::StateStore(format!("corrupt record {}: {e}", path.display()))
        })
    }

    fn write_temp(&self, id: &CycleId, cycle: &Cycle) -> Result<PathBuf> {
        let bytes = serde_json::to_vec_pretty(cycle)?;
        let tmp = self.temp_path(id);
        let mut file = fs::File::create(&tmp).map_err(|e| store_err(&tmp, "creating", e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| store_err(&tmp, "writing", e))?;
        Ok(tmp)
    }

    fn sync_dir(&self) {
        if let Ok(dir) = fs::File::open(&self.root) {
            let _ = dir.sync_all();
        }
    }
}

fn store_err(path: &Path, action: &str, e: io::Error) -> ForecycleError {
    ForecycleError::StateStore(format!("{action} {}: {e}", path.display()))
}

impl CycleStore for FileCycleStore {
    fn load(&self, id: &CycleId) -> Result<Option<Cycle>> {
        self.read_record(&self.record_path(id))
    }

    fn create(&self, cycle: &Cycle) -> Result<bool> {
        let path = self.record_path(&cycle.cycle_id);
        let tmp = self.write_temp(&cycle.cycle_id, cycle)?;

        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                self.sync_dir();
                debug!(cycle_id = %cycle.cycle_id, "created cycle record");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(store_err(&path, "linking", e)),
        }
    }

    fn save(&self, cycle: &mut Cycle) -> Result<()> {
        let lock_path = self.root.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| store_err(&lock_path, "opening", e))?;
        lock.lock_exclusive()
            .map_err(|e| store_err(&lock_path, "locking", e))?;

        let path = self.record_path(&cycle.cycle_id);
        let current = self
            .read_record(&path)?
            .ok_or_else(|| ForecycleError::CycleNotFound(cycle.cycle_id.to_string()))?;
        if current.revision != cycle.revision {
            return Err(ForecycleError::StateConflict {
                cycle_id: cycle.cycle_id.to_string(),
            });
        }

        let mut next = cycle.clone();
        next.revision += 1;
        let tmp = self.write_temp(&next.cycle_id, &next)?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(store_err(&path, "renaming", e));
        }
        self.sync_dir();
        let _ = FileExt::unlock(&lock);

        cycle.revision = next.revision;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cycle>> {
        let entries = fs::read_dir(&self.root).map_err(|e| store_err(&self.root, "reading", e))?;
        let mut cycles = Vec::new();

        for entry in entries {
            let path = entry.map_err(|e| store_err(&self.root, "reading", e))?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            // One bad record must not hide the others.
            match self.read_record(&path) {
                Ok(Some(cycle)) => cycles.push(cycle),
                Ok(None) => {}
                Err(e) => error!(path = %path.display(), error = %e, "skipping unreadable cycle record"),
            }
        }

        cycles.sort_by(|a, b| {
            a.reference_time
                .cmp(&b.reference_time)
                .then_with(|| a.cycle_id.cmp(&b.cycle_id))
        });
        Ok(cycles)
    }

    fn remove(&self, id: &CycleId) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err(&path, "removing", e)),
        }
    }
}
