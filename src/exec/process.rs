// src/exec/process.rs

//! Stage runner backed by OS processes.

use std::collections::BTreeMap;
use std::fs::File;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::chain::{MarkerInputs, StageDescriptor};
use crate::exec::artifacts::{AttemptArtifacts, AttemptSummary, tail_lines};
use crate::exec::backend::{
    AttemptContext, AttemptResult, Interrupt, InterruptReceiver, StageOutcome, StageRunner,
    wait_for_interrupt,
};
use crate::fs::{FileSystem, RealFileSystem, fingerprint};

/// Lines of stderr carried into a `FAILED` diagnostic.
const DIAGNOSTIC_TAIL_LINES: usize = 5;

/// Runs a stage through `sh -c` with output redirected into the attempt
/// logs, enforces its timeout and classifies the result against its
/// success markers.
#[derive(Debug, Clone)]
pub struct ProcessStageRunner {
    fs: Arc<dyn FileSystem>,
}

impl Default for ProcessStageRunner {
    fn default() -> Self {
        Self::new(Arc::new(RealFileSystem))
    }
}

impl ProcessStageRunner {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    async fn run_attempt(
        &self,
        stage: &StageDescriptor,
        ctx: &AttemptContext,
        mut interrupt: InterruptReceiver,
    ) -> AttemptResult {
        let artifacts = AttemptArtifacts::new(&ctx.workdir, &stage.name, ctx.attempt);
        let command = stage.command.render(&ctx.template(&stage.name));
        let started_at = Utc::now();

        info!(
            cycle_id = %ctx.cycle_id,
            stage = %stage.name,
            attempt = ctx.attempt,
            cmd = %command,
            "starting stage process"
        );

        let mut child = match self.spawn(stage, ctx, &artifacts, &command) {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    cycle_id = %ctx.cycle_id,
                    stage = %stage.name,
                    error = %err,
                    "stage process could not be started"
                );
                let outcome = StageOutcome::Failed {
                    exit_code: -1,
                    diagnostic: format!("{err:#}"),
                };
                self.write_summary(ctx, stage, &artifacts, &command, started_at, &outcome, None);
                return AttemptResult::Finished(outcome);
            }
        };

        // The process either exits, hits its deadline, or is interrupted.
        let status: ExitStatus = tokio::select! {
            status_res = child.wait() => match status_res {
                Ok(status) => status,
                Err(e) => {
                    let outcome = StageOutcome::Failed {
                        exit_code: -1,
                        diagnostic: format!("waiting for process: {e}"),
                    };
                    self.write_summary(ctx, stage, &artifacts, &command, started_at, &outcome, None);
                    return AttemptResult::Finished(outcome);
                }
            },

            _ = tokio::time::sleep(stage.timeout) => {
                warn!(
                    cycle_id = %ctx.cycle_id,
                    stage = %stage.name,
                    timeout_secs = stage.timeout.as_secs(),
                    "stage exceeded its timeout; killing process"
                );
                kill(&mut child, ctx, stage).await;
                let outcome = StageOutcome::TimedOut;
                self.write_summary(ctx, stage, &artifacts, &command, started_at, &outcome, None);
                return AttemptResult::Finished(outcome);
            }

            reason = wait_for_interrupt(&mut interrupt) => {
                info!(
                    cycle_id = %ctx.cycle_id,
                    stage = %stage.name,
                    ?reason,
                    "attempt interrupted; killing process"
                );
                kill(&mut child, ctx, stage).await;
                self.write_interrupted(ctx, stage, &artifacts, &command, started_at, reason);
                return AttemptResult::Interrupted(reason);
            }
        };

        let code = status.code().unwrap_or(-1);
        info!(
            cycle_id = %ctx.cycle_id,
            stage = %stage.name,
            attempt = ctx.attempt,
            exit_code = code,
            "stage process exited"
        );

        let (outcome, fingerprints) = self.classify(stage, ctx, &artifacts, code);
        self.write_summary(
            ctx,
            stage,
            &artifacts,
            &command,
            started_at,
            &outcome,
            Some((code, fingerprints)),
        );
        AttemptResult::Finished(outcome)
    }

    fn spawn(
        &self,
        stage: &StageDescriptor,
        ctx: &AttemptContext,
        artifacts: &AttemptArtifacts,
        command: &str,
    ) -> Result<Child> {
        let run_dir = stage.run_dir(&ctx.workdir);
        self.fs.create_dir_all(&run_dir)?;
        self.fs.create_dir_all(artifacts.dir())?;

        let stdout = File::create(artifacts.stdout_log())
            .with_context(|| format!("creating {:?}", artifacts.stdout_log()))?;
        let stderr = File::create(artifacts.stderr_log())
            .with_context(|| format!("creating {:?}", artifacts.stderr_log()))?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(&run_dir)
            .envs(forecycle_env(stage, ctx))
            .envs(&stage.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        // Own process group, so a kill reaches everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
            .with_context(|| format!("spawning process for stage '{}'", stage.name))
    }

    /// Apply the markers in order: exit code first, then evidence.
    fn classify(
        &self,
        stage: &StageDescriptor,
        ctx: &AttemptContext,
        artifacts: &AttemptArtifacts,
        code: i32,
    ) -> (StageOutcome, BTreeMap<String, String>) {
        if !stage.markers.exit_code_ok(code) {
            let diagnostic = tail_lines(
                self.fs.as_ref(),
                &artifacts.stderr_log(),
                DIAGNOSTIC_TAIL_LINES,
            );
            return (
                StageOutcome::Failed {
                    exit_code: code,
                    diagnostic,
                },
                BTreeMap::new(),
            );
        }

        let stdout_log = artifacts.stdout_log();
        let stderr_log = artifacts.stderr_log();
        let report = stage.markers.check_evidence(
            self.fs.as_ref(),
            MarkerInputs {
                workdir: &ctx.workdir,
                stdout_log: Some(&stdout_log),
                stderr_log: Some(&stderr_log),
            },
        );
        if !report.satisfied() {
            debug!(
                cycle_id = %ctx.cycle_id,
                stage = %stage.name,
                missing = ?report.missing,
                "success markers not met"
            );
            return (
                StageOutcome::MarkersMissing {
                    missing: report.missing,
                },
                BTreeMap::new(),
            );
        }

        let mut fingerprints = BTreeMap::new();
        for rel in &report.matched_files {
            match fingerprint(self.fs.as_ref(), &ctx.workdir.join(rel)) {
                Ok(hash) => {
                    fingerprints.insert(rel.to_string_lossy().replace('\\', "/"), hash);
                }
                Err(e) => warn!(file = %rel.display(), error = %e, "could not fingerprint output"),
            }
        }
        (StageOutcome::Success, fingerprints)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_summary(
        &self,
        ctx: &AttemptContext,
        stage: &StageDescriptor,
        artifacts: &AttemptArtifacts,
        command: &str,
        started_at: DateTime<Utc>,
        outcome: &StageOutcome,
        exit: Option<(i32, BTreeMap<String, String>)>,
    ) {
        let (exit_code, fingerprints) = match exit {
            Some((code, prints)) => (Some(code), prints),
            None => (None, BTreeMap::new()),
        };
        let (diagnostic, missing_markers) = match outcome {
            StageOutcome::Success => (None, Vec::new()),
            StageOutcome::MarkersMissing { missing } => (None, missing.clone()),
            other => (Some(other.diagnostic()), Vec::new()),
        };
        let summary = AttemptSummary {
            cycle_id: ctx.cycle_id.to_string(),
            stage: stage.name.clone(),
            attempt: ctx.attempt,
            command: command.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.label().to_string(),
            exit_code,
            diagnostic,
            missing_markers,
            fingerprints,
        };
        self.persist_summary(&summary, artifacts);
    }

    fn write_interrupted(
        &self,
        ctx: &AttemptContext,
        stage: &StageDescriptor,
        artifacts: &AttemptArtifacts,
        command: &str,
        started_at: DateTime<Utc>,
        reason: Interrupt,
    ) {
        let outcome = match reason {
            Interrupt::Shutdown => "INTERRUPTED",
            Interrupt::Cancel => "CANCELLED",
        };
        let summary = AttemptSummary {
            cycle_id: ctx.cycle_id.to_string(),
            stage: stage.name.clone(),
            attempt: ctx.attempt,
            command: command.to_string(),
            started_at,
            finished_at: Utc::now(),
            outcome: outcome.to_string(),
            exit_code: None,
            diagnostic: None,
            missing_markers: Vec::new(),
            fingerprints: BTreeMap::new(),
        };
        self.persist_summary(&summary, artifacts);
    }

    fn persist_summary(&self, summary: &AttemptSummary, artifacts: &AttemptArtifacts) {
        if let Err(e) = summary.write(self.fs.as_ref(), &artifacts.summary_path()) {
            warn!(
                path = %artifacts.summary_path().display(),
                error = %e,
                "could not write attempt summary"
            );
        }
    }
}

impl StageRunner for ProcessStageRunner {
    fn execute<'a>(
        &'a self,
        stage: &'a StageDescriptor,
        ctx: &'a AttemptContext,
        interrupt: InterruptReceiver,
    ) -> Pin<Box<dyn Future<Output = AttemptResult> + Send + 'a>> {
        Box::pin(self.run_attempt(stage, ctx, interrupt))
    }
}

async fn kill(child: &mut Child, ctx: &AttemptContext, stage: &StageDescriptor) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_group(pid, ctx, stage);
    }
    if let Err(e) = child.kill().await {
        warn!(
            cycle_id = %ctx.cycle_id,
            stage = %stage.name,
            error = %e,
            "failed to kill stage process"
        );
    }
}

/// SIGKILL the stage's process group before the leader is reaped.
#[cfg(unix)]
fn kill_group(pid: u32, ctx: &AttemptContext, stage: &StageDescriptor) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the group; no memory is touched.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        warn!(
            cycle_id = %ctx.cycle_id,
            stage = %stage.name,
            error = %std::io::Error::last_os_error(),
            "failed to kill stage process group"
        );
    }
}

/// Variables every stage process sees.
fn forecycle_env(stage: &StageDescriptor, ctx: &AttemptContext) -> Vec<(&'static str, String)> {
    vec![
        ("FORECYCLE_CYCLE_ID", ctx.cycle_id.to_string()),
        ("FORECYCLE_CHAIN", ctx.chain.clone()),
        ("FORECYCLE_STAGE", stage.name.clone()),
        ("FORECYCLE_REF_TIME", rfc3339(ctx.reference_time)),
        ("FORECYCLE_END_TIME", rfc3339(ctx.end_time)),
        ("FORECYCLE_WORKDIR", path_string(&ctx.workdir)),
        ("FORECYCLE_ATTEMPT", ctx.attempt.to_string()),
    ]
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
