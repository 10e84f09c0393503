// src/exec/artifacts.rs

//! Per-attempt files under `<workdir>/.forecycle/<stage>/`.
//!
//! Every launch gets its own `attempt-NN.*` triple; nothing here ever
//! deletes or truncates an earlier attempt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::markers::ARTIFACT_DIR;
use crate::fs::FileSystem;
use crate::types::OutputStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptArtifacts {
    dir: PathBuf,
    attempt: u32,
}

impl AttemptArtifacts {
    pub fn new(workdir: &Path, stage: &str, attempt: u32) -> Self {
        Self {
            dir: workdir.join(ARTIFACT_DIR).join(stage),
            attempt,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn log(&self, stream: OutputStream) -> PathBuf {
        self.dir
            .join(format!("attempt-{:02}.{}", self.attempt, stream.log_suffix()))
    }

    pub fn stdout_log(&self) -> PathBuf {
        self.log(OutputStream::Stdout)
    }

    pub fn stderr_log(&self) -> PathBuf {
        self.log(OutputStream::Stderr)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join(format!("attempt-{:02}.json", self.attempt))
    }
}

/// Contents of `attempt-NN.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub cycle_id: String,
    pub stage: String,
    pub attempt: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_markers: Vec<String>,
    /// blake3 of each file matched by a `file` marker, keyed by relative path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fingerprints: BTreeMap<String, String>,
}

impl AttemptSummary {
    pub fn load(fs: &dyn FileSystem, path: &Path) -> anyhow::Result<Self> {
        let text = fs.read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, fs: &dyn FileSystem, path: &Path) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fs.write(path, &bytes)
    }
}

/// Last `max_lines` non-empty lines of a log, joined with " | ".
pub fn tail_lines(fs: &dyn FileSystem, path: &Path, max_lines: usize) -> String {
    let Ok(text) = fs.read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join(" | ")
}
