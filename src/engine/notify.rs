// src/engine/notify.rs

//! Best-effort downstream notification after a cycle finishes.
//!
//! Writes the chain's marker file into the working directory and runs the
//! hook command. Nothing here can change a cycle's status: failures are
//! logged and journaled, then dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::chain::{Chain, NotifySpec, TemplateContext};
use crate::fs::FileSystem;
use crate::state::{Cycle, CycleStatus, Journal, JournalEvent, StageRecord};

/// JSON body of the marker file.
#[derive(Debug, Serialize)]
struct NotifyPayload<'a> {
    cycle_id: &'a str,
    chain: &'a str,
    status: CycleStatus,
    reference_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    working_directory: &'a std::path::Path,
    last_diagnostic: Option<&'a str>,
    stages: &'a [StageRecord],
}

#[derive(Debug, Clone)]
pub struct Notifier {
    fs: Arc<dyn FileSystem>,
    journal: Arc<Journal>,
}

impl Notifier {
    pub fn new(fs: Arc<dyn FileSystem>, journal: Arc<Journal>) -> Self {
        Self { fs, journal }
    }

    /// Notify for a cycle that just reached a terminal status, if the chain
    /// asks for it.
    pub async fn cycle_finished(&self, chain: &Chain, cycle: &Cycle) {
        let Some(spec) = chain.notify() else {
            return;
        };
        let wanted = match cycle.status {
            CycleStatus::Succeeded => true,
            CycleStatus::FailedTerminal => spec.on_failure,
            _ => false,
        };
        if !wanted {
            return;
        }

        if let Some(marker) = spec.marker.as_deref() {
            if let Err(e) = self.write_marker(chain, cycle, marker) {
                self.report_failure(cycle, &format!("marker {marker}: {e:#}"));
            }
        }
        if spec.command.is_some() {
            if let Err(e) = run_hook(self.fs.as_ref(), chain, spec, cycle).await {
                self.report_failure(cycle, &format!("hook: {e:#}"));
            }
        }
    }

    fn write_marker(&self, chain: &Chain, cycle: &Cycle, marker: &str) -> Result<PathBuf> {
        let path = cycle.working_directory.join(marker);
        let payload = NotifyPayload {
            cycle_id: cycle.cycle_id.as_str(),
            chain: chain.name(),
            status: cycle.status,
            reference_time: cycle.reference_time,
            end_time: chain.end_time(cycle.reference_time),
            finished_at: cycle.finished_at,
            working_directory: &cycle.working_directory,
            last_diagnostic: cycle.last_diagnostic.as_deref(),
            stages: &cycle.history,
        };
        let bytes = serde_json::to_vec_pretty(&payload)?;
        self.fs.write(&path, &bytes)?;
        info!(cycle_id = %cycle.cycle_id, path = %path.display(), "wrote notification marker");
        Ok(path)
    }

    fn report_failure(&self, cycle: &Cycle, detail: &str) {
        warn!(cycle_id = %cycle.cycle_id, detail, "downstream notification failed");
        self.journal
            .record(&cycle.cycle_id, JournalEvent::NotifyFailed, detail);
    }
}

async fn run_hook(
    fs: &dyn FileSystem,
    chain: &Chain,
    spec: &NotifySpec,
    cycle: &Cycle,
) -> Result<()> {
    let Some(template) = &spec.command else {
        return Ok(());
    };
    let command = template.render(&TemplateContext {
        cycle_id: cycle.cycle_id.as_str(),
        chain: chain.name(),
        stage: "notify",
        reference_time: cycle.reference_time,
        end_time: chain.end_time(cycle.reference_time),
        workdir: &cycle.working_directory,
        attempt: 0,
    });

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command);
    if fs.is_dir(&cycle.working_directory) {
        cmd.current_dir(&cycle.working_directory);
    }
    cmd.env("FORECYCLE_CYCLE_ID", cycle.cycle_id.as_str())
        .env("FORECYCLE_CHAIN", chain.name())
        .env("FORECYCLE_STATUS", cycle.status.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning notify hook '{command}'"))?;

    match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(status) => {
            let status = status.context("waiting for notify hook")?;
            if !status.success() {
                return Err(anyhow!(
                    "'{command}' exited with {}",
                    status.code().unwrap_or(-1)
                ));
            }
            info!(cycle_id = %cycle.cycle_id, cmd = %command, "notify hook finished");
            Ok(())
        }
        Err(_) => {
            let _ = child.kill().await;
            Err(anyhow!("'{command}' timed out"))
        }
    }
}
