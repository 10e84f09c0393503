#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use forecycle::config::{
    ChainConfig, ConfigFile, ConfigSection, MarkerConfig, NotifyConfig, RawConfigFile, StageConfig,
};
use forecycle::types::{BackoffKind, OutputStream};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                chain: BTreeMap::new(),
            },
        }
    }

    pub fn with_chain(mut self, name: &str, chain: ChainConfig) -> Self {
        self.config.chain.insert(name.to_string(), chain);
        self
    }

    /// Point `state_dir` and `work_root` into `root`.
    pub fn with_root(mut self, root: &Path) -> Self {
        self.config.config.state_dir = root.join("state");
        self.config.config.work_root = root.join("runs");
        self
    }

    pub fn with_retention(mut self, retention: &str) -> Self {
        self.config.config.retention = retention.to_string();
        self
    }

    pub fn with_staleness(mut self, staleness: &str) -> Self {
        self.config.config.staleness_threshold = staleness.to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: &str) -> Self {
        self.config.config.poll_interval = interval.to_string();
        self
    }

    pub fn with_max_concurrent_cycles(mut self, max: usize) -> Self {
        self.config.config.max_concurrent_cycles = max;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ChainConfig`.
pub struct ChainConfigBuilder {
    chain: ChainConfig,
}

impl ChainConfigBuilder {
    pub fn new(cadence: &str) -> Self {
        Self {
            chain: ChainConfig {
                cadence: cadence.to_string(),
                lead_time: "0s".to_string(),
                offset: "0s".to_string(),
                horizon: "0s".to_string(),
                catch_up: 0,
                weekdays: vec![],
                not_before: None,
                acquire: None,
                stage: BTreeMap::new(),
                notify: None,
            },
        }
    }

    pub fn lead_time(mut self, lead: &str) -> Self {
        self.chain.lead_time = lead.to_string();
        self
    }

    pub fn offset(mut self, offset: &str) -> Self {
        self.chain.offset = offset.to_string();
        self
    }

    pub fn horizon(mut self, horizon: &str) -> Self {
        self.chain.horizon = horizon.to_string();
        self
    }

    pub fn catch_up(mut self, n: u32) -> Self {
        self.chain.catch_up = n;
        self
    }

    pub fn weekday(mut self, day: &str) -> Self {
        self.chain.weekdays.push(day.to_string());
        self
    }

    pub fn not_before(mut self, at: &str) -> Self {
        self.chain.not_before = Some(at.to_string());
        self
    }

    pub fn acquire(mut self, stage: StageConfig) -> Self {
        self.chain.acquire = Some(stage);
        self
    }

    pub fn stage(mut self, name: &str, stage: StageConfig) -> Self {
        self.chain.stage.insert(name.to_string(), stage);
        self
    }

    pub fn notify(mut self, notify: NotifyConfig) -> Self {
        self.chain.notify = Some(notify);
        self
    }

    pub fn build(self) -> ChainConfig {
        self.chain
    }
}

/// Builder for `StageConfig`.
pub struct StageConfigBuilder {
    stage: StageConfig,
}

impl StageConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            stage: StageConfig {
                cmd: cmd.to_string(),
                after: None,
                cwd: None,
                env: BTreeMap::new(),
                timeout: "1h".to_string(),
                max_retries: 0,
                retry_backoff: "0s".to_string(),
                backoff: BackoffKind::Fixed,
                backoff_factor: 2,
                backoff_max: None,
                success: vec![],
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.stage.after = Some(dep.to_string());
        self
    }

    pub fn cwd(mut self, dir: &str) -> Self {
        self.stage.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.stage.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: &str) -> Self {
        self.stage.timeout = timeout.to_string();
        self
    }

    pub fn retries(mut self, max_retries: u32, backoff: &str) -> Self {
        self.stage.max_retries = max_retries;
        self.stage.retry_backoff = backoff.to_string();
        self
    }

    pub fn exponential(mut self, factor: u32, max: Option<&str>) -> Self {
        self.stage.backoff = BackoffKind::Exponential;
        self.stage.backoff_factor = factor;
        self.stage.backoff_max = max.map(str::to_string);
        self
    }

    pub fn exit_code(mut self, min: i32, max: i32) -> Self {
        self.stage.success.push(MarkerConfig::ExitCode { min, max });
        self
    }

    pub fn file_marker(mut self, glob: &str, min_count: usize) -> Self {
        self.stage.success.push(MarkerConfig::File {
            glob: glob.to_string(),
            min_count,
        });
        self
    }

    pub fn stdout_pattern(mut self, regex: &str) -> Self {
        self.stage.success.push(MarkerConfig::Pattern {
            regex: regex.to_string(),
            stream: OutputStream::Stdout,
            file: None,
        });
        self
    }

    pub fn file_pattern(mut self, regex: &str, file: &str) -> Self {
        self.stage.success.push(MarkerConfig::Pattern {
            regex: regex.to_string(),
            stream: OutputStream::Stdout,
            file: Some(file.into()),
        });
        self
    }

    pub fn build(self) -> StageConfig {
        self.stage
    }
}

/// `prepare -> model -> post` on a 24h cadence with a 6h lead time.
pub fn coastal_chain() -> ChainConfig {
    ChainConfigBuilder::new("24h")
        .lead_time("6h")
        .horizon("72h")
        .stage("prepare", StageConfigBuilder::new("prepare {workdir}").build())
        .stage(
            "model",
            StageConfigBuilder::new("run-model {ref:%Y%m%d}")
                .after("prepare")
                .build(),
        )
        .stage("post", StageConfigBuilder::new("post {end}").after("model").build())
        .build()
}
