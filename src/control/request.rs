// src/control/request.rs

//! Requests from CLI invocations to a running daemon, passed as JSON files
//! in `<state_dir>/control/`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{ForecycleError, Result};
use crate::state::CycleId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Poll for due cycles now instead of at the next tick.
    Poll,
    /// Abort a cycle this daemon is driving.
    Cancel { cycle_id: CycleId },
}

pub fn control_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("control")
}

/// Drop a request for the daemon. The file appears atomically under its
/// final name, so the daemon never reads half a request.
pub fn submit(state_dir: &Path, request: &ControlRequest) -> Result<PathBuf> {
    let dir = control_dir(state_dir);
    fs::create_dir_all(&dir)?;

    let stamp = format!("{}-{}", Utc::now().timestamp_micros(), std::process::id());
    let tmp = dir.join(format!(".{stamp}.tmp"));
    let path = dir.join(format!("{stamp}.json"));

    let bytes = serde_json::to_vec(request)?;
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Take every pending request, oldest first, deleting the files.
/// Unparseable files are logged and removed.
pub fn drain(state_dir: &Path) -> Result<Vec<ControlRequest>> {
    let mut requests = Vec::new();
    drain_with(state_dir, |request| {
        requests.push(request);
        true
    })?;
    Ok(requests)
}

/// Offer every pending request, oldest first, to `handle`. A request is
/// deleted once `handle` returns `true`; otherwise its file stays for
/// another daemon or a later pass. Unparseable files are logged and removed.
pub fn drain_with<F>(state_dir: &Path, mut handle: F) -> Result<()>
where
    F: FnMut(ControlRequest) -> bool,
{
    let dir = control_dir(state_dir);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(ForecycleError::IoError(e)),
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.') && n.ends_with(".json"))
        })
        .collect();
    paths.sort();

    for path in paths {
        let parsed = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<ControlRequest>(&bytes).map_err(anyhow::Error::from),
            // Taken by another daemon in the meantime.
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => Err(e.into()),
        };
        let consumed = match parsed {
            Ok(request) => handle(request),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding malformed control request");
                true
            }
        };
        if !consumed {
            continue;
        }
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not remove control request");
            }
        }
    }
    Ok(())
}
