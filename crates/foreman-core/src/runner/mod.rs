//! Composition runners.
//!
//! Each runner drives one composition over a [`Dispatcher`] and a run-scoped
//! [`SharedState`], and returns a single [`ResultEnvelope`] whose `steps`
//! record every step it executed or resumed.

pub mod approval;
pub mod parallel;
pub mod quality_gate;
pub mod sequential;

pub use approval::{ActionDescriptor, ApprovalGate};
pub use parallel::ParallelFanOut;
pub use quality_gate::{LoopReport, LoopState, LoopTransition, QualityGateLoop};
pub use sequential::SequentialPipeline;

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::warn;

use crate::envelope::{CompletionPromise, ResultEnvelope, StepRecord};
use crate::error::{ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::state::{validate_key, SharedState, INPUT_KEY};
use crate::worker::{Dispatcher, Step};

/// Completed steps of a previous attempt, indexed by output key.
#[derive(Debug, Clone, Default)]
pub struct Resume {
    completed: HashMap<String, StepRecord>,
}

impl Resume {
    /// Nothing to resume from.
    pub fn none() -> Self {
        Self::default()
    }

    /// Collect the complete steps of `previous`. Incomplete or failed steps
    /// are ignored and will run again.
    pub fn from_previous(previous: &ResultEnvelope) -> Self {
        let completed = previous
            .steps
            .iter()
            .filter(|record| record.is_complete())
            .map(|record| (record.output_key.clone(), record.clone()))
            .collect();
        Self { completed }
    }

    /// The reusable record for `step`, if the previous attempt completed it
    /// with the same skill.
    pub fn completed(&self, step: &Step) -> Option<&StepRecord> {
        self.completed
            .get(&step.output_key)
            .filter(|record| record.skill_id == step.skill_id)
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }
}

/// Read-only collaborators shared by every step of one run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub task_id: &'a str,
    pub dispatcher: &'a Dispatcher,
    pub resume: &'a Resume,
}

impl<'a> RunContext<'a> {
    pub fn new(task_id: &'a str, dispatcher: &'a Dispatcher, resume: &'a Resume) -> Self {
        Self {
            task_id,
            dispatcher,
            resume,
        }
    }

    /// Deterministic id for the sub-task producing `output_key`, stable
    /// across attempts of the same task.
    pub fn sub_task_id(&self, output_key: &str) -> String {
        format!("{}/{}", self.task_id, output_key)
    }

    /// The previous attempt's record for `step`, provided its result still
    /// satisfies the skill's output contract. A record that does not is
    /// ignored and the step runs again.
    pub fn reusable(&self, step: &Step) -> Option<&'a StepRecord> {
        let record = self.resume.completed(step)?;
        let result = record.result.as_ref().unwrap_or(&Value::Null);
        match self.dispatcher.contracts().validate_output(&step.skill_id, result) {
            Ok(()) => Some(record),
            Err(violations) => {
                warn!(
                    task_id = %self.task_id,
                    skill_id = %step.skill_id,
                    output_key = %step.output_key,
                    violations = violations.len(),
                    "previous result violates the output contract; running the step again"
                );
                None
            }
        }
    }
}

/// How a step's input template treats keys whose producer failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Strict,
    Markers,
}

/// A step's accepted result.
#[derive(Debug, Clone)]
pub(crate) struct StepValue {
    pub value: Value,
    pub promise: CompletionPromise,
}

/// Resume or dispatch one step and commit its result to `state`.
///
/// On failure the step's error envelope is returned unchanged; nothing is
/// written to `state`. Either way a [`StepRecord`] is appended to `records`.
pub(crate) async fn run_step(
    ctx: &RunContext<'_>,
    state: &mut SharedState,
    step: &Step,
    resolution: Resolution,
    records: &mut Vec<StepRecord>,
) -> Result<StepValue, ResultEnvelope> {
    if let Some(record) = ctx.reusable(step) {
        let value = record.result.clone().unwrap_or(Value::Null);
        if let Err(e) = state.put(&step.output_key, value.clone()) {
            return Err(fail_step(step, &e, records));
        }
        records.push(record.clone());
        METRICS.inc_steps_skipped();
        obs::emit_step_skipped(ctx.task_id, &step.output_key);
        return Ok(StepValue {
            value,
            promise: CompletionPromise::Complete,
        });
    }

    let resolved = match resolution {
        Resolution::Strict => state.resolve_template(&step.input_template),
        Resolution::Markers => state.resolve_template_with_markers(&step.input_template),
    };
    let input = match resolved {
        Ok(input) => input,
        Err(e) => return Err(fail_step(step, &e, records)),
    };

    let envelope = ctx
        .dispatcher
        .dispatch(&ctx.sub_task_id(&step.output_key), &step.skill_id, input)
        .await;
    commit(state, step, envelope, records)
}

/// Record a dispatched step's envelope and, on success, write its result.
pub(crate) fn commit(
    state: &mut SharedState,
    step: &Step,
    envelope: ResultEnvelope,
    records: &mut Vec<StepRecord>,
) -> Result<StepValue, ResultEnvelope> {
    records.push(StepRecord::from_envelope(&step.output_key, &step.skill_id, &envelope));
    if !envelope.is_success() {
        warn!(
            skill_id = %step.skill_id,
            output_key = %step.output_key,
            reason = envelope.reason.as_deref().unwrap_or_default(),
            "step failed"
        );
        return Err(envelope);
    }
    let value = envelope.result.unwrap_or(Value::Null);
    if let Err(e) = state.put(&step.output_key, value.clone()) {
        // Keep the record consistent with what actually landed in state.
        records.pop();
        return Err(fail_step(step, &e, records));
    }
    Ok(StepValue {
        value,
        promise: envelope.completion_promise,
    })
}

fn fail_step(step: &Step, err: &ForemanError, records: &mut Vec<StepRecord>) -> ResultEnvelope {
    let envelope = ResultEnvelope::from_error(err);
    records.push(StepRecord::from_envelope(&step.output_key, &step.skill_id, &envelope));
    envelope
}

/// Check a set of output keys at construction time: each must be a valid
/// key, must not shadow `input`, and must be distinct.
pub(crate) fn check_output_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> ForemanResult<()> {
    let mut seen = BTreeSet::new();
    for key in keys {
        validate_key(key)?;
        if key == INPUT_KEY {
            return Err(ForemanError::InvalidComposition(format!(
                "output key {INPUT_KEY:?} is reserved for the task input"
            )));
        }
        if !seen.insert(key) {
            return Err(ForemanError::OutputKeyCollision {
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

/// Check that `template` reads only from `visible` keys.
pub(crate) fn check_reads(
    skill_id: &str,
    template: &Value,
    visible: &BTreeSet<&str>,
) -> ForemanResult<()> {
    for key in crate::state::referenced_keys(template) {
        if !visible.contains(key.as_str()) {
            return Err(ForemanError::InvalidComposition(format!(
                "step {skill_id} reads {{{key}}}, which is not produced before it runs"
            )));
        }
    }
    Ok(())
}
