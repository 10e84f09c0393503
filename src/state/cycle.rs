// src/state/cycle.rs

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::Chain;

const STAMP_FORMAT: &str = "%Y%m%dT%H%MZ";

/// Deterministic key of a cycle: `<chain>@<reference time>`, e.g.
/// `coastal@20240301T0000Z`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CycleId(String);

impl CycleId {
    pub fn new(chain: &str, reference_time: DateTime<Utc>) -> Self {
        Self(format!("{chain}@{}", Self::stamp(reference_time)))
    }

    /// Minute-resolution UTC stamp used in ids and directory names.
    pub fn stamp(reference_time: DateTime<Utc>) -> String {
        reference_time.format(STAMP_FORMAT).to_string()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn chain(&self) -> &str {
        self.0.split_once('@').map(|(c, _)| c).unwrap_or(&self.0)
    }

    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        let (_, stamp) = self.0.split_once('@')?;
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CycleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((chain, _)) = s.split_once('@') else {
            return Err(format!("cycle id '{s}' must look like <chain>@YYYYMMDDTHHMMZ"));
        };
        let chain_ok = !chain.is_empty()
            && chain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        let id = CycleId(s.to_string());
        if !chain_ok || id.reference_time().is_none() {
            return Err(format!("cycle id '{s}' must look like <chain>@YYYYMMDDTHHMMZ"));
        }
        Ok(id)
    }
}

impl TryFrom<String> for CycleId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CycleId> for String {
    fn from(id: CycleId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    Pending,
    Running,
    StageFailed,
    Retrying,
    Succeeded,
    FailedTerminal,
}

impl CycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleStatus::Succeeded | CycleStatus::FailedTerminal)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CycleStatus::Pending => "PENDING",
            CycleStatus::Running => "RUNNING",
            CycleStatus::StageFailed => "STAGE_FAILED",
            CycleStatus::Retrying => "RETRYING",
            CycleStatus::Succeeded => "SUCCEEDED",
            CycleStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a stage ended, as recorded in the cycle history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Succeeded,
    /// Found complete by re-checking markers after a restart.
    Recovered,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    /// Attempts spent on the stage, including the final one.
    pub attempts: u32,
    pub result: StageResult,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Ownership claim on a cycle. Only the owner may drive it until
/// `expires_at`; heartbeats push the expiry forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Durable record of one forecast cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_id: CycleId,
    pub chain: String,
    pub reference_time: DateTime<Utc>,
    pub status: CycleStatus,
    pub current_stage_index: usize,
    /// Retries spent on the current stage; 0 on the first attempt.
    pub attempt_count: u32,
    /// Launches of the current stage, persisted before each launch. Names
    /// the attempt artifacts so a relaunch never overwrites old ones.
    #[serde(default)]
    pub launch_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the current stage was first launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_started_at: Option<DateTime<Utc>>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub last_diagnostic: Option<String>,
    #[serde(default)]
    pub history: Vec<StageRecord>,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Bumped by every successful save; used for compare-and-swap.
    #[serde(default)]
    pub revision: u64,
}

impl Cycle {
    pub fn new_pending(
        chain: &Chain,
        reference_time: DateTime<Utc>,
        work_root: &Path,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle_id: chain.cycle_id(reference_time),
            chain: chain.name().to_string(),
            reference_time,
            status: CycleStatus::Pending,
            current_stage_index: 0,
            attempt_count: 0,
            launch_count: 0,
            retry_at: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            stage_started_at: None,
            working_directory: chain.working_directory(work_root, reference_time),
            last_diagnostic: None,
            history: Vec::new(),
            lease: None,
            acknowledged_at: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_live(now))
    }

    pub fn leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|l| l.owner == owner && l.is_live(now))
    }

    /// Active with no live owner: presumed abandoned and free to resume.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && !self.has_live_lease(now)
    }

    /// Time since the record was last written or heartbeated.
    pub fn silent_for(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.updated_at
    }

    /// History entry of a stage, newest wins.
    pub fn stage_record(&self, stage: &str) -> Option<&StageRecord> {
        self.history.iter().rev().find(|r| r.stage == stage)
    }
}
