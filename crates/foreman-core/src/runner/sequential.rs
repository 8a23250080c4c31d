//! Fail-fast sequential pipeline.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::instrument;

use super::{check_output_keys, check_reads, run_step, Resolution, RunContext};
use crate::envelope::{CompletionPromise, ResultEnvelope};
use crate::error::{ForemanError, ForemanResult};
use crate::state::{SharedState, INPUT_KEY};
use crate::worker::Step;

/// Ordered steps; each may read the task input and any earlier step's key.
#[derive(Debug, Clone)]
pub struct SequentialPipeline {
    steps: Vec<Step>,
}

impl SequentialPipeline {
    /// # Errors
    ///
    /// [`ForemanError::InvalidComposition`] for an empty pipeline or a step
    /// reading a key no earlier step produces;
    /// [`ForemanError::OutputKeyCollision`] for repeated output keys.
    pub fn new(steps: Vec<Step>) -> ForemanResult<Self> {
        if steps.is_empty() {
            return Err(ForemanError::InvalidComposition(
                "sequential pipeline needs at least one step".into(),
            ));
        }
        check_output_keys(steps.iter().map(|s| s.output_key.as_str()))?;

        let mut visible: BTreeSet<&str> = BTreeSet::from([INPUT_KEY]);
        for step in &steps {
            check_reads(&step.skill_id, &step.input_template, &visible)?;
            visible.insert(step.output_key.as_str());
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure.
    ///
    /// The failing step's envelope is returned as is (reason, error kind and
    /// completion promise preserved) with the step records attached. On
    /// success the result is the last step's result; the run is `COMPLETE`
    /// unless some step reported `IN_PROGRESS`.
    #[instrument(skip_all, fields(task_id = %ctx.task_id, steps = self.steps.len()))]
    pub async fn run(&self, ctx: &RunContext<'_>, state: &mut SharedState) -> ResultEnvelope {
        let mut records = Vec::with_capacity(self.steps.len());
        let mut last = Value::Null;
        let mut promise = CompletionPromise::Complete;

        for step in &self.steps {
            match run_step(ctx, state, step, Resolution::Strict, &mut records).await {
                Ok(outcome) => {
                    if outcome.promise == CompletionPromise::InProgress {
                        promise = CompletionPromise::InProgress;
                    }
                    last = outcome.value;
                }
                Err(failed) => return failed.with_steps(records),
            }
        }

        let mut envelope = ResultEnvelope::success(last).with_steps(records);
        envelope.completion_promise = promise;
        envelope
    }
}
