// src/chain/descriptor.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chain::markers::SuccessMarkers;
use crate::chain::retry::RetryPolicy;
use crate::chain::template::CommandTemplate;

/// Immutable definition of one pipeline step.
///
/// Built once from config and shared (behind `Arc`) by every cycle of the
/// chain. The executor interprets it; nothing else builds command strings.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: String,
    pub command: CommandTemplate,
    /// Run directory relative to the cycle working directory.
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub markers: SuccessMarkers,
    /// Predecessor in the chain; `None` for the first stage.
    pub depends_on: Option<String>,
}

impl StageDescriptor {
    /// Descriptor with a one-hour timeout, no retries and the implicit
    /// "exit code 0" marker.
    pub fn new(name: impl Into<String>, command: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            command,
            cwd: None,
            env: BTreeMap::new(),
            timeout: Duration::from_secs(60 * 60),
            retry: RetryPolicy::no_retries(),
            markers: SuccessMarkers::default(),
            depends_on: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_markers(mut self, markers: SuccessMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Directory the process runs in for a given cycle working directory.
    pub fn run_dir(&self, workdir: &Path) -> PathBuf {
        match &self.cwd {
            Some(rel) => workdir.join(rel),
            None => workdir.to_path_buf(),
        }
    }
}
