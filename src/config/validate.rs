// src/config/validate.rs

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc, Weekday};

use crate::chain::graph::linear_order;
use crate::chain::{
    ACQUIRE_STAGE, Backoff, Chain, ChainSet, CommandTemplate, NotifySpec, RetryPolicy, Schedule,
    StageDescriptor, SuccessMarkers,
};
use crate::config::duration::parse_duration;
use crate::config::model::{
    ChainConfig, ConfigFile, ConfigSection, NotifyConfig, RawConfigFile, Settings, StageConfig,
};
use crate::errors::{ForecycleError, Result};
use crate::types::BackoffKind;

/// Upper bound on `catch_up`: windows one poll may look back over.
const MAX_CATCH_UP: u32 = 10_000;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::ForecycleError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_chains(&raw)?;
        let settings = compile_settings(&raw.config)?;

        let mut chains = Vec::with_capacity(raw.chain.len());
        for (name, cfg) in raw.chain.iter() {
            chains.push(compile_chain(name, cfg)?);
        }
        validate_retention(&settings, &chains)?;

        Ok(ConfigFile::new_unchecked(settings, ChainSet::new(chains)))
    }
}

/// Run every check `TryFrom` runs, discarding the compiled result.
pub fn validate_config(raw: &RawConfigFile) -> Result<()> {
    ConfigFile::try_from(raw.clone()).map(|_| ())
}

fn config_err(msg: impl Into<String>) -> ForecycleError {
    ForecycleError::ConfigError(msg.into())
}

fn ensure_has_chains(cfg: &RawConfigFile) -> Result<()> {
    if cfg.chain.is_empty() {
        return Err(config_err(
            "config must contain at least one [chain.<name>] section",
        ));
    }
    Ok(())
}

/// Chain and stage names end up in file names and cycle ids.
fn validate_name(kind: &str, name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !ok {
        return Err(config_err(format!(
            "{kind} name '{name}' may only contain letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

fn duration_field(context: &str, field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| config_err(format!("{context}.{field}: {e}")))
}

fn positive_duration_field(context: &str, field: &str, value: &str) -> Result<Duration> {
    let d = duration_field(context, field, value)?;
    if d.is_zero() {
        return Err(config_err(format!("{context}.{field} must be greater than zero")));
    }
    Ok(d)
}

fn to_delta(context: &str, field: &str, d: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(d).map_err(|_| config_err(format!("{context}.{field} is out of range")))
}

fn compile_settings(section: &ConfigSection) -> Result<Settings> {
    let poll_interval = positive_duration_field("[config]", "poll_interval", &section.poll_interval)?;
    let staleness_threshold = positive_duration_field(
        "[config]",
        "staleness_threshold",
        &section.staleness_threshold,
    )?;
    let retention = positive_duration_field("[config]", "retention", &section.retention)?;

    if section.max_concurrent_cycles == 0 {
        return Err(config_err(
            "[config].max_concurrent_cycles must be >= 1 (got 0)",
        ));
    }
    if let Some(instance) = section.instance_name.as_deref() {
        validate_name("[config].instance_name", instance)?;
    }

    Ok(Settings {
        state_dir: section.state_dir.clone(),
        work_root: section.work_root.clone(),
        poll_interval,
        staleness_threshold,
        retention,
        max_concurrent_cycles: section.max_concurrent_cycles,
        instance_name: section.instance_name.clone(),
    })
}

fn compile_chain(name: &str, cfg: &ChainConfig) -> Result<Chain> {
    validate_name("chain", name)?;
    let ctx = format!("[chain.{name}]");

    if cfg.stage.is_empty() {
        return Err(config_err(format!(
            "{ctx} must define at least one [chain.{name}.stage.<stage>]"
        )));
    }
    if cfg.acquire.is_some() && cfg.stage.contains_key(ACQUIRE_STAGE) {
        return Err(config_err(format!(
            "{ctx}: stage name '{ACQUIRE_STAGE}' is reserved when an acquire section is present"
        )));
    }

    let cadence = positive_duration_field(&ctx, "cadence", &cfg.cadence)?;
    let lead_time = duration_field(&ctx, "lead_time", &cfg.lead_time)?;
    let offset = duration_field(&ctx, "offset", &cfg.offset)?;
    let horizon = duration_field(&ctx, "horizon", &cfg.horizon)?;
    if offset >= cadence {
        return Err(config_err(format!("{ctx}.offset must be shorter than cadence")));
    }
    if cfg.catch_up > MAX_CATCH_UP {
        return Err(config_err(format!("{ctx}.catch_up must be at most {MAX_CATCH_UP}")));
    }

    let weekdays = cfg
        .weekdays
        .iter()
        .map(|d| {
            d.parse::<Weekday>()
                .map_err(|_| config_err(format!("{ctx}.weekdays: unknown weekday '{d}'")))
        })
        .collect::<Result<Vec<_>>>()?;

    let not_before = match cfg.not_before.as_deref() {
        Some(s) => Some(
            DateTime::parse_from_rfc3339(s)
                .map_err(|e| config_err(format!("{ctx}.not_before '{s}': {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let schedule = Schedule::new(
        to_delta(&ctx, "cadence", cadence)?,
        to_delta(&ctx, "lead_time", lead_time)?,
    )
    .map_err(|e| config_err(format!("{ctx}: {e}")))?
    .with_offset(to_delta(&ctx, "offset", offset)?)
    .with_catch_up(cfg.catch_up)
    .with_weekdays(weekdays)
    .with_not_before(not_before);

    let order = linear_order(&cfg.stage).map_err(|e| config_err(format!("{ctx}: {e}")))?;

    let mut stages = Vec::with_capacity(order.len() + 1);
    if let Some(acquire) = &cfg.acquire {
        stages.push(compile_stage(name, ACQUIRE_STAGE, acquire, None)?);
    }
    for stage_name in &order {
        validate_name("stage", stage_name)?;
        let stage_cfg = &cfg.stage[stage_name];
        // The first configured stage implicitly follows acquisition.
        let depends_on = stage_cfg
            .after
            .clone()
            .or_else(|| cfg.acquire.as_ref().map(|_| ACQUIRE_STAGE.to_string()));
        stages.push(compile_stage(name, stage_name, stage_cfg, depends_on)?);
    }

    let notify = cfg
        .notify
        .as_ref()
        .map(|n| compile_notify(name, n))
        .transpose()?;

    Ok(Chain::new(name, schedule, stages)
        .with_horizon(to_delta(&ctx, "horizon", horizon)?)
        .with_notify(notify))
}

fn compile_stage(
    chain: &str,
    name: &str,
    cfg: &StageConfig,
    depends_on: Option<String>,
) -> Result<StageDescriptor> {
    let ctx = if name == ACQUIRE_STAGE {
        format!("[chain.{chain}.acquire]")
    } else {
        format!("[chain.{chain}.stage.{name}]")
    };

    let command =
        CommandTemplate::parse(&cfg.cmd).map_err(|e| config_err(format!("{ctx}.cmd: {e}")))?;
    if cfg.cmd.trim().is_empty() {
        return Err(config_err(format!("{ctx}.cmd must not be empty")));
    }
    if let Some(cwd) = &cfg.cwd {
        if cwd.is_absolute() {
            return Err(config_err(format!(
                "{ctx}.cwd '{}' must be relative to the cycle working directory",
                cwd.display()
            )));
        }
    }

    let timeout = positive_duration_field(&ctx, "timeout", &cfg.timeout)?;
    let base = duration_field(&ctx, "retry_backoff", &cfg.retry_backoff)?;
    let backoff = match cfg.backoff {
        BackoffKind::Fixed => Backoff::fixed(base),
        BackoffKind::Exponential => {
            if cfg.backoff_factor == 0 {
                return Err(config_err(format!("{ctx}.backoff_factor must be >= 1")));
            }
            let max = cfg
                .backoff_max
                .as_deref()
                .map(|m| duration_field(&ctx, "backoff_max", m))
                .transpose()?;
            Backoff::exponential(base, cfg.backoff_factor, max)
        }
    };
    let markers =
        SuccessMarkers::compile(&cfg.success).map_err(|e| config_err(format!("{ctx}.success: {e}")))?;

    let mut stage = StageDescriptor::new(name, command)
        .with_timeout(timeout)
        .with_retry(RetryPolicy {
            max_retries: cfg.max_retries,
            backoff,
        })
        .with_markers(markers);
    stage.cwd = cfg.cwd.clone();
    stage.env = cfg.env.clone();
    stage.depends_on = depends_on;
    Ok(stage)
}

fn compile_notify(chain: &str, cfg: &NotifyConfig) -> Result<NotifySpec> {
    let ctx = format!("[chain.{chain}.notify]");
    if cfg.marker.is_none() && cfg.cmd.is_none() {
        return Err(config_err(format!("{ctx} needs `marker`, `cmd` or both")));
    }
    if let Some(marker) = cfg.marker.as_deref() {
        if marker.is_empty() || marker.contains('/') || marker.contains('\\') {
            return Err(config_err(format!(
                "{ctx}.marker '{marker}' must be a plain file name"
            )));
        }
    }
    let command = cfg
        .cmd
        .as_deref()
        .map(|c| CommandTemplate::parse(c).map_err(|e| config_err(format!("{ctx}.cmd: {e}"))))
        .transpose()?;

    Ok(NotifySpec {
        marker: cfg.marker.clone(),
        command,
        on_failure: cfg.on_failure,
        timeout: positive_duration_field(&ctx, "timeout", &cfg.timeout)?,
    })
}

/// Pruning must never remove a record the scheduler could still want to
/// create, or the window would be run twice.
fn validate_retention(settings: &Settings, chains: &[Chain]) -> Result<()> {
    let retention = to_delta("[config]", "retention", settings.retention)?;
    for chain in chains {
        let Some(lookback) = chain.schedule().lookback() else {
            return Err(config_err(format!(
                "[chain.{}]: lead_time + (catch_up + 1) * cadence is out of range",
                chain.name()
            )));
        };
        if retention <= lookback {
            return Err(config_err(format!(
                "[config].retention must exceed the lookback of chain '{}' ({}h)",
                chain.name(),
                lookback.num_hours()
            )));
        }
    }
    Ok(())
}
