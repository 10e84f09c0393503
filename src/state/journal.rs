// src/state/journal.rs

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::state::cycle::CycleId;

/// Kinds of line written to the operations journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEvent {
    Created,
    StageSucceeded,
    StageRecovered,
    StageFailed,
    Succeeded,
    FailedTerminal,
    Cancelled,
    Retried,
    Acknowledged,
    Pruned,
    NotifyFailed,
}

impl JournalEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalEvent::Created => "CREATED",
            JournalEvent::StageSucceeded => "STAGE_SUCCEEDED",
            JournalEvent::StageRecovered => "STAGE_RECOVERED",
            JournalEvent::StageFailed => "STAGE_FAILED",
            JournalEvent::Succeeded => "SUCCEEDED",
            JournalEvent::FailedTerminal => "FAILED_TERMINAL",
            JournalEvent::Cancelled => "CANCELLED",
            JournalEvent::Retried => "RETRIED",
            JournalEvent::Acknowledged => "ACKNOWLEDGED",
            JournalEvent::Pruned => "PRUNED",
            JournalEvent::NotifyFailed => "NOTIFY_FAILED",
        }
    }
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub at: DateTime<Utc>,
    pub cycle_id: String,
    pub event: String,
    pub detail: String,
}

/// Append-only `timestamp;cycle_id;EVENT;detail` log under the state dir.
///
/// Audit only: nothing reads it back to decide behaviour, so write failures
/// are logged and otherwise ignored by [`Journal::record`].
#[derive(Debug)]
pub struct Journal {
    path: Option<PathBuf>,
    guard: Mutex<()>,
}

impl Journal {
    pub fn open(state_dir: &Path) -> Self {
        Self {
            path: Some(state_dir.join("journal.log")),
            guard: Mutex::new(()),
        }
    }

    /// A journal that drops every entry.
    pub fn disabled() -> Self {
        Self {
            path: None,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, cycle_id: &CycleId, event: JournalEvent, detail: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let line = format!(
            "{};{};{};{}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            cycle_id,
            event,
            sanitize(detail)
        );

        let _guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening journal {:?}", path))?
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to journal {:?}", path))?;
        Ok(())
    }

    /// Append, logging instead of failing.
    pub fn record(&self, cycle_id: &CycleId, event: JournalEvent, detail: &str) {
        if let Err(e) = self.append(cycle_id, event, detail) {
            warn!(cycle_id = %cycle_id, event = %event, error = %e, "journal write failed");
        }
    }

    /// Parse every well-formed line. Malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading journal {:?}", path)),
        };
        Ok(text.lines().filter_map(parse_line).collect())
    }
}

fn sanitize(detail: &str) -> String {
    detail
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_line(line: &str) -> Option<JournalEntry> {
    let mut parts = line.splitn(4, ';');
    let at = DateTime::parse_from_rfc3339(parts.next()?).ok()?.with_timezone(&Utc);
    Some(JournalEntry {
        at,
        cycle_id: parts.next()?.to_string(),
        event: parts.next()?.to_string(),
        detail: parts.next().unwrap_or_default().to_string(),
    })
}
