use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forecycle::chain::StageDescriptor;
use forecycle::exec::{
    AttemptContext, AttemptResult, InterruptReceiver, StageOutcome, StageRunner,
    wait_for_interrupt,
};
use forecycle::fs::mock::MockFileSystem;
use forecycle::state::CycleId;

/// What one scripted attempt does.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Return this outcome immediately.
    Finish(StageOutcome),
    /// Sleep, then return the outcome (or the interrupt, if one comes first).
    Slow(Duration, StageOutcome),
    /// Block until interrupted.
    Hang,
    /// Add files to the mock filesystem, then succeed.
    Produce(Vec<String>),
}

/// One call to [`ScriptedRunner::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCall {
    pub cycle_id: CycleId,
    pub stage: String,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct Script {
    steps: BTreeMap<String, VecDeque<ScriptedStep>>,
    calls: Vec<RunnerCall>,
}

/// A fake stage runner that:
/// - records every attempt it is asked to run
/// - plays back scripted steps per stage name, succeeding once a stage's
///   script is exhausted.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    script: Arc<Mutex<Script>>,
    fs: Option<MockFileSystem>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner whose `Produce` steps write into `fs`.
    pub fn with_fs(fs: MockFileSystem) -> Self {
        Self {
            script: Arc::default(),
            fs: Some(fs),
        }
    }

    pub fn push(&self, stage: &str, step: ScriptedStep) -> &Self {
        let mut script = self.script.lock().unwrap();
        script
            .steps
            .entry(stage.to_string())
            .or_default()
            .push_back(step);
        self
    }

    /// Queue the same outcome `times` times.
    pub fn fail(&self, stage: &str, outcome: StageOutcome, times: usize) -> &Self {
        for _ in 0..times {
            self.push(stage, ScriptedStep::Finish(outcome.clone()));
        }
        self
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Stage names in launch order.
    pub fn stages_run(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.stage).collect()
    }

    pub fn attempts_of(&self, stage: &str) -> usize {
        self.calls().iter().filter(|c| c.stage == stage).count()
    }

    fn next_step(&self, stage: &str, ctx: &AttemptContext) -> ScriptedStep {
        let mut script = self.script.lock().unwrap();
        script.calls.push(RunnerCall {
            cycle_id: ctx.cycle_id.clone(),
            stage: stage.to_string(),
            attempt: ctx.attempt,
        });
        script
            .steps
            .get_mut(stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedStep::Finish(StageOutcome::Success))
    }
}

impl StageRunner for ScriptedRunner {
    fn execute<'a>(
        &'a self,
        stage: &'a StageDescriptor,
        ctx: &'a AttemptContext,
        mut interrupt: InterruptReceiver,
    ) -> Pin<Box<dyn Future<Output = AttemptResult> + Send + 'a>> {
        let step = self.next_step(&stage.name, ctx);

        Box::pin(async move {
            match step {
                ScriptedStep::Finish(outcome) => AttemptResult::Finished(outcome),
                ScriptedStep::Slow(delay, outcome) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => AttemptResult::Finished(outcome),
                        reason = wait_for_interrupt(&mut interrupt) => AttemptResult::Interrupted(reason),
                    }
                }
                ScriptedStep::Hang => {
                    AttemptResult::Interrupted(wait_for_interrupt(&mut interrupt).await)
                }
                ScriptedStep::Produce(files) => {
                    if let Some(fs) = &self.fs {
                        for file in files {
                            fs.add_file(ctx.workdir.join(file), b"data".to_vec());
                        }
                    }
                    AttemptResult::Finished(StageOutcome::Success)
                }
            }
        })
    }
}
