use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::chain::ChainSet;
use crate::types::{BackoffKind, OutputStream};

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// state_dir = "/srv/forecast/state"
/// work_root = "/srv/forecast/runs"
/// poll_interval = "1m"
///
/// [chain.coastal]
/// cadence = "24h"
/// lead_time = "6h"
/// horizon = "72h"
///
/// [chain.coastal.acquire]
/// cmd = "fetch-forcing --date {ref:%Y%m%d} --out {workdir}/forcing"
///
/// [chain.coastal.stage.prepare]
/// cmd = "prepare-run {workdir} {ref:%Y-%m-%dT%H:%M} {end:%Y-%m-%dT%H:%M}"
///
/// [chain.coastal.stage.model]
/// after = "prepare"
/// cmd = "mpirun -np 8 MohidWater.exe"
/// cwd = "exe"
/// timeout = "6h"
/// success = [{ kind = "pattern", regex = "successfully terminated" }]
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    /// Global behaviour from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// All chains from `[chain.<name>]`.
    #[serde(default)]
    pub chain: BTreeMap<String, ChainConfig>,
}

/// Validated configuration.
///
/// Only obtainable through `TryFrom<RawConfigFile>` (see `validate.rs`), so
/// holding one means durations parsed, chains are linear, templates parse and
/// markers compile. The compiled forms are what the rest of the crate uses.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    settings: Settings,
    chains: ChainSet,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(settings: Settings, chains: ChainSet) -> Self {
        Self { settings, chains }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn chains(&self) -> &ChainSet {
        &self.chains
    }

    pub fn into_parts(self) -> (Settings, ChainSet) {
        (self.settings, self.chains)
    }
}

/// Compiled `[config]` section.
#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub work_root: PathBuf,
    pub poll_interval: Duration,
    pub staleness_threshold: Duration,
    pub retention: Duration,
    pub max_concurrent_cycles: usize,
    pub instance_name: Option<String>,
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Where cycle records, the journal and control requests live.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Root under which each cycle's working directory is created.
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,

    /// How often the daemon polls for due cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// A non-terminal cycle whose lease has not been refreshed for this long
    /// is presumed crashed and handed back to the orchestrator.
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold: String,

    /// Terminal cycle records are kept at least this long.
    #[serde(default = "default_retention")]
    pub retention: String,

    /// Maximum number of cycles one process drives at the same time.
    #[serde(default = "default_max_concurrent_cycles")]
    pub max_concurrent_cycles: usize,

    /// Optional label prefixed to the lease owner of this process.
    #[serde(default)]
    pub instance_name: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".forecycle")
}

fn default_work_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_poll_interval() -> String {
    "1m".to_string()
}

fn default_staleness_threshold() -> String {
    "15m".to_string()
}

fn default_retention() -> String {
    "30d".to_string()
}

fn default_max_concurrent_cycles() -> usize {
    4
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            work_root: default_work_root(),
            poll_interval: default_poll_interval(),
            staleness_threshold: default_staleness_threshold(),
            retention: default_retention(),
            max_concurrent_cycles: default_max_concurrent_cycles(),
            instance_name: None,
        }
    }
}

/// `[chain.<name>]` section: one forecast product with its own cadence and
/// stage chain.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Distance between consecutive reference times, e.g. `"24h"`.
    pub cadence: String,

    /// How long after its reference time a cycle becomes due.
    #[serde(default = "zero_duration")]
    pub lead_time: String,

    /// Anchor of the cadence grid relative to 00:00 UTC.
    #[serde(default = "zero_duration")]
    pub offset: String,

    /// Forecast length; `{end}` renders as reference time + horizon.
    #[serde(default = "zero_duration")]
    pub horizon: String,

    /// Number of additional past windows the scheduler creates if missing.
    #[serde(default)]
    pub catch_up: u32,

    /// Restrict reference times to these weekdays (`"mon"`, `"sunday"`...).
    #[serde(default)]
    pub weekdays: Vec<String>,

    /// Never create cycles for reference times before this instant (RFC3339).
    #[serde(default)]
    pub not_before: Option<String>,

    /// Optional forcing-data acquisition, run before the first stage.
    #[serde(default)]
    pub acquire: Option<StageConfig>,

    /// Stages keyed by name; order comes from `after`.
    #[serde(default)]
    pub stage: BTreeMap<String, StageConfig>,

    /// Downstream notification on completion.
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

fn zero_duration() -> String {
    "0s".to_string()
}

/// `[chain.<name>.stage.<stage>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Command template, run through `sh -c`.
    pub cmd: String,

    /// Predecessor stage. Exactly one stage per chain has none.
    #[serde(default)]
    pub after: Option<String>,

    /// Directory (relative to the cycle working directory) to run in.
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Extra environment variables for the process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Wall-clock limit before the process is killed.
    #[serde(default = "default_stage_timeout")]
    pub timeout: String,

    #[serde(default)]
    pub max_retries: u32,

    /// Base delay between retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String,

    #[serde(default)]
    pub backoff: BackoffKind,

    /// Growth factor for exponential backoff.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: u32,

    /// Upper bound for exponential backoff.
    #[serde(default)]
    pub backoff_max: Option<String>,

    /// Conditions that together define success. Empty means "exit code 0".
    #[serde(default)]
    pub success: Vec<MarkerConfig>,
}

fn default_stage_timeout() -> String {
    "1h".to_string()
}

fn default_retry_backoff() -> String {
    "1m".to_string()
}

fn default_backoff_factor() -> u32 {
    2
}

/// One success condition of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarkerConfig {
    /// Exit status within `min..=max`.
    ExitCode {
        #[serde(default)]
        min: i32,
        #[serde(default)]
        max: i32,
    },
    /// At least `min_count` files under the working directory match `glob`.
    File {
        glob: String,
        #[serde(default = "default_min_count")]
        min_count: usize,
    },
    /// `regex` matches a line of the captured output, or of `file` when set.
    Pattern {
        regex: String,
        #[serde(default)]
        stream: OutputStream,
        #[serde(default)]
        file: Option<PathBuf>,
    },
}

fn default_min_count() -> usize {
    1
}

/// `[chain.<name>.notify]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    /// File name written into the working directory when the cycle finishes.
    #[serde(default)]
    pub marker: Option<String>,

    /// Hook command template, fire-and-forget.
    #[serde(default)]
    pub cmd: Option<String>,

    /// Also notify when a cycle ends FAILED_TERMINAL.
    #[serde(default)]
    pub on_failure: bool,

    #[serde(default = "default_notify_timeout")]
    pub timeout: String,
}

fn default_notify_timeout() -> String {
    "1m".to_string()
}
