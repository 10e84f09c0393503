// src/control/watcher.rs

use std::path::Path;

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::control::request::control_dir;
use crate::engine::RuntimeEvent;

/// Keeps the underlying `RecommendedWatcher` alive. Dropping this handle
/// stops watching.
pub struct ControlWatcher {
    _inner: RecommendedWatcher,
}

impl std::fmt::Debug for ControlWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlWatcher").finish()
    }
}

/// Watch `<state_dir>/control/` and send [`RuntimeEvent::ControlPending`]
/// whenever a request file lands there.
pub fn spawn_control_watcher(
    state_dir: &Path,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
) -> Result<ControlWatcher> {
    let dir = control_dir(state_dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating dir {:?}", dir))?;

    // Channel from the blocking notify callback into the async world.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(err) => {
                eprintln!("forecycle: control watch error: {err}");
            }
        },
        Config::default(),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("watching control requests in {:?}", dir);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            let is_request = event.paths.iter().any(|p| {
                p.extension().is_some_and(|ext| ext == "json")
            });
            if !is_request {
                continue;
            }
            debug!(?event, "control request arrived");
            if runtime_tx.send(RuntimeEvent::ControlPending).await.is_err() {
                warn!("runtime gone; stopping control watcher");
                break;
            }
        }
    });

    Ok(ControlWatcher { _inner: watcher })
}
