// src/chain/mod.rs

//! Static description of forecast chains.
//!
//! - [`descriptor`] holds the immutable [`StageDescriptor`].
//! - [`template`] parses and renders command templates.
//! - [`markers`] compiles and checks success markers.
//! - [`retry`] computes retry backoff.
//! - [`schedule`] decides which reference times are due.
//! - [`graph`] orders stages by their `after` links.
//!
//! Everything here is built once at startup and read-only afterwards.

pub mod descriptor;
pub mod graph;
pub mod markers;
pub mod retry;
pub mod schedule;
pub mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub use descriptor::StageDescriptor;
pub use markers::{MarkerInputs, MarkerReport, SuccessMarkers};
pub use retry::{Backoff, RetryPolicy};
pub use schedule::Schedule;
pub use template::{CommandTemplate, TemplateContext};

use crate::state::CycleId;

/// Name of the acquisition stage prepended when `[chain.<name>.acquire]` is set.
pub const ACQUIRE_STAGE: &str = "acquire";

/// Compiled `[chain.<name>.notify]`.
#[derive(Debug, Clone)]
pub struct NotifySpec {
    pub marker: Option<String>,
    pub command: Option<CommandTemplate>,
    pub on_failure: bool,
    pub timeout: Duration,
}

/// One forecast product: a cadence and an ordered, linear list of stages.
#[derive(Debug, Clone)]
pub struct Chain {
    name: String,
    schedule: Schedule,
    horizon: TimeDelta,
    stages: Vec<Arc<StageDescriptor>>,
    notify: Option<NotifySpec>,
}

impl Chain {
    pub fn new(name: impl Into<String>, schedule: Schedule, stages: Vec<StageDescriptor>) -> Self {
        Self {
            name: name.into(),
            schedule,
            horizon: TimeDelta::zero(),
            stages: stages.into_iter().map(Arc::new).collect(),
            notify: None,
        }
    }

    pub fn with_horizon(mut self, horizon: TimeDelta) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn with_notify(mut self, notify: Option<NotifySpec>) -> Self {
        self.notify = notify;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn horizon(&self) -> TimeDelta {
        self.horizon
    }

    pub fn notify(&self) -> Option<&NotifySpec> {
        self.notify.as_ref()
    }

    pub fn stages(&self) -> &[Arc<StageDescriptor>] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&Arc<StageDescriptor>> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_last(&self, index: usize) -> bool {
        index + 1 >= self.stages.len()
    }

    pub fn cycle_id(&self, reference_time: DateTime<Utc>) -> CycleId {
        CycleId::new(&self.name, reference_time)
    }

    pub fn end_time(&self, reference_time: DateTime<Utc>) -> DateTime<Utc> {
        reference_time + self.horizon
    }

    /// Working directory of a cycle: `<work_root>/<chain>/<stamp>`.
    pub fn working_directory(&self, work_root: &Path, reference_time: DateTime<Utc>) -> PathBuf {
        work_root
            .join(&self.name)
            .join(CycleId::stamp(reference_time))
    }
}

/// All configured chains, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ChainSet {
    chains: BTreeMap<String, Arc<Chain>>,
}

impl ChainSet {
    pub fn new(chains: impl IntoIterator<Item = Chain>) -> Self {
        Self {
            chains: chains
                .into_iter()
                .map(|c| (c.name().to_string(), Arc::new(c)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Chain>> {
        self.chains.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Chain>> {
        self.chains.values()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}
