// src/lib.rs

pub mod chain;
pub mod cli;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod state;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chain::ChainSet;
use crate::cli::{CliArgs, Command};
use crate::config::duration::format_duration;
use crate::config::loader::load_and_validate;
use crate::config::model::{ConfigFile, Settings};
use crate::control::operator::{self, CancelResult};
use crate::control::request::{self, ControlRequest};
use crate::engine::{
    CycleScheduler, Orchestrator, OrchestratorOptions, Runtime, RuntimeEvent, RuntimeOptions,
};
use crate::errors::{ForecycleError, Result};
use crate::exec::{ProcessStageRunner, StageRunner};
use crate::fs::{FileSystem, RealFileSystem};
use crate::state::{CycleId, CycleStore, FileCycleStore, Journal};

/// High-level entry point used by `main.rs`.
///
/// Loads and validates the config, then dispatches the subcommand. Every
/// subcommand, `check` included, fails with a configuration error before
/// touching any state if the config is invalid.
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)?;
    debug!(config = %config_path.display(), chains = cfg.chains().len(), "config loaded");

    match args.command {
        Command::Check => {
            print_check(&cfg);
            Ok(())
        }
        Command::Run { once } => run_daemon(cfg, once).await,
        Command::Poll => {
            let path = request::submit(&cfg.settings().state_dir, &ControlRequest::Poll)?;
            println!("poll requested ({})", path.display());
            Ok(())
        }
        Command::Status { all, json } => {
            let store = open_store(cfg.settings())?;
            let rows = operator::status(&store, cfg.chains(), all, Utc::now())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print!("{}", operator::render_status(&rows));
            }
            Ok(())
        }
        Command::Retry { cycle_id } => {
            let (store, journal) = open_state(cfg.settings())?;
            let id = parse_cycle_id(&cycle_id)?;
            let cycle = operator::force_retry(&store, &journal, &id, Utc::now())?;
            println!("{} re-armed at stage {}", cycle.cycle_id, cycle.current_stage_index);
            Ok(())
        }
        Command::Cancel { cycle_id } => {
            let (store, journal) = open_state(cfg.settings())?;
            let id = parse_cycle_id(&cycle_id)?;
            match operator::cancel(
                &store,
                &journal,
                cfg.chains(),
                &cfg.settings().state_dir,
                &id,
                Utc::now(),
            )? {
                CancelResult::Cancelled(cycle) => println!("{} cancelled", cycle.cycle_id),
                CancelResult::Forwarded { owner } => {
                    println!("{id} is running under {owner}; cancel request queued")
                }
            }
            Ok(())
        }
        Command::Ack { cycle_id } => {
            let (store, journal) = open_state(cfg.settings())?;
            let id = parse_cycle_id(&cycle_id)?;
            operator::acknowledge(&store, &journal, &id, Utc::now())?;
            println!("{id} acknowledged");
            Ok(())
        }
        Command::Prune => {
            let (store, journal) = open_state(cfg.settings())?;
            let pruned = operator::prune(&store, &journal, cfg.settings().retention, Utc::now())?;
            println!("pruned {} record(s)", pruned.len());
            Ok(())
        }
    }
}

fn parse_cycle_id(raw: &str) -> Result<CycleId> {
    raw.parse()
        .map_err(|e: String| ForecycleError::Other(anyhow::anyhow!(e)))
}

fn open_store(settings: &Settings) -> Result<FileCycleStore> {
    FileCycleStore::open(&settings.state_dir)
}

fn open_state(settings: &Settings) -> Result<(FileCycleStore, Journal)> {
    Ok((open_store(settings)?, Journal::open(&settings.state_dir)))
}

/// Lease owner for this process: `<instance>-<pid>-<start time>`.
fn lease_owner(settings: &Settings) -> String {
    format!(
        "{}-{}-{}",
        settings.instance_name.as_deref().unwrap_or("forecycle"),
        std::process::id(),
        Utc::now().timestamp()
    )
}

async fn run_daemon(cfg: ConfigFile, once: bool) -> Result<()> {
    let (settings, chains) = cfg.into_parts();
    std::fs::create_dir_all(&settings.state_dir)?;
    std::fs::create_dir_all(&settings.work_root)?;

    let store: Arc<dyn CycleStore> = Arc::new(open_store(&settings)?);
    let journal = Arc::new(Journal::open(&settings.state_dir));
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let runner: Arc<dyn StageRunner> = Arc::new(ProcessStageRunner::new(fs.clone()));

    let owner = lease_owner(&settings);
    info!(%owner, state_dir = %settings.state_dir.display(), "starting forecycle");

    let orchestrator = Arc::new(Orchestrator::new(
        chains.clone(),
        store.clone(),
        runner,
        fs,
        journal.clone(),
        OrchestratorOptions {
            owner,
            work_root: settings.work_root.clone(),
            lease_ttl: settings.staleness_threshold,
        },
    ));
    let scheduler = CycleScheduler::new(
        chains,
        store,
        journal.clone(),
        settings.work_root.clone(),
        settings.retention,
    );

    let (rt_tx, rt_rx) = mpsc::channel::<RuntimeEvent>(64);

    // Control requests only matter to a long-running daemon.
    let _watcher = if once {
        None
    } else {
        Some(control::spawn_control_watcher(&settings.state_dir, rt_tx.clone())?)
    };

    spawn_signal_handler(rt_tx.clone());

    let options = RuntimeOptions {
        poll_interval: settings.poll_interval,
        max_concurrent_cycles: settings.max_concurrent_cycles,
        retention: settings.retention,
        state_dir: settings.state_dir.clone(),
        exit_when_idle: once,
    };
    Runtime::new(scheduler, orchestrator, journal, rt_rx, options)
        .run()
        .await
}

/// Ctrl-C or SIGTERM → graceful shutdown.
fn spawn_signal_handler(tx: mpsc::Sender<RuntimeEvent>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "failed to listen for SIGTERM");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
                    }
                    return;
                }
            };
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        warn!(error = %e, "failed to listen for Ctrl+C");
                        return;
                    }
                }
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
        }
        let _ = tx.send(RuntimeEvent::ShutdownRequested).await;
    });
}

fn human(delta: TimeDelta) -> String {
    delta
        .to_std()
        .map(format_duration)
        .unwrap_or_else(|_| delta.to_string())
}

/// `check` output: the compiled chains, stages and their policies.
fn print_check(cfg: &ConfigFile) {
    let settings = cfg.settings();
    println!("forecycle check");
    println!("  state_dir           = {}", settings.state_dir.display());
    println!("  work_root           = {}", settings.work_root.display());
    println!("  poll_interval       = {}", format_duration(settings.poll_interval));
    println!("  staleness_threshold = {}", format_duration(settings.staleness_threshold));
    println!("  retention           = {}", format_duration(settings.retention));
    println!("  max_concurrent      = {}", settings.max_concurrent_cycles);
    println!();
    print_chains(cfg.chains());
}

fn print_chains(chains: &ChainSet) {
    println!("chains ({}):", chains.len());
    for chain in chains.iter() {
        let schedule = chain.schedule();
        println!(
            "  - {} (cadence {}, lead {}, horizon {}, catch_up {})",
            chain.name(),
            human(schedule.cadence()),
            human(schedule.lead_time()),
            human(chain.horizon()),
            schedule.catch_up()
        );
        if !schedule.weekdays().is_empty() {
            println!("      weekdays: {:?}", schedule.weekdays());
        }
        for (i, stage) in chain.stages().iter().enumerate() {
            let (min, max) = stage.markers.exit_range();
            println!("      {}. {}", i + 1, stage.name);
            println!("         cmd: {}", stage.command);
            println!(
                "         timeout {}, max_retries {}, backoff {:?} {}",
                format_duration(stage.timeout),
                stage.retry.max_retries,
                stage.retry.backoff.kind,
                format_duration(stage.retry.backoff.base)
            );
            println!("         success: exit {min}..={max}");
            for evidence in stage.markers.evidence() {
                println!("         success: {evidence}");
            }
        }
        if let Some(notify) = chain.notify() {
            if let Some(marker) = &notify.marker {
                println!("      notify marker: {marker}");
            }
            if let Some(cmd) = &notify.command {
                println!("      notify cmd: {cmd}");
            }
        }
    }
}
