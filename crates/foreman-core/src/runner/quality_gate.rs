//! Bounded generate-then-critique loop.
//!
//! ```text
//! GENERATE -> CRITIQUE -> ESCALATE                 (verdict PASS)
//!                      -> RETRY -> GENERATE ...    (FAIL, iterations left)
//!                      -> EXHAUSTED                (FAIL on the last iteration)
//! ```
//!
//! Every transition is recorded in a [`LoopReport`] returned with the
//! result. Each iteration runs in a fork of the shared state, so only the
//! final `output` and `verdict` are ever committed.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{instrument, warn};

use super::{check_reads, RunContext};
use crate::envelope::{CompletionPromise, EnvelopeStatus, ResultEnvelope, StepRecord, Verdict};
use crate::error::{ErrorKind, ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::state::{SharedState, INPUT_KEY};
use crate::worker::Step;

/// Key the generator's result is stored under.
pub const OUTPUT_KEY: &str = "output";
/// Key the critic's verdict is stored under.
pub const VERDICT_KEY: &str = "verdict";
/// Key holding the 1-based iteration number inside an iteration scope.
pub const ITERATION_KEY: &str = "iteration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    Generate,
    Critique,
    Escalate,
    Retry,
    Exhausted,
    /// Stopped on a failure retrying cannot fix (contract violation, bad wiring).
    Blocked,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Generate => "GENERATE",
            Self::Critique => "CRITIQUE",
            Self::Escalate => "ESCALATE",
            Self::Retry => "RETRY",
            Self::Exhausted => "EXHAUSTED",
            Self::Blocked => "BLOCKED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopTransition {
    pub iteration: u32,
    pub from: LoopState,
    pub to: LoopState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// What happened inside one loop run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopReport {
    pub max_iterations: u32,
    /// Iterations started, including the last.
    pub iterations: u32,
    pub final_state: LoopState,
    pub transitions: Vec<LoopTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl LoopReport {
    fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            iterations: 0,
            final_state: LoopState::Generate,
            transitions: Vec::new(),
            last_output: None,
            last_verdict: None,
            warnings: Vec::new(),
        }
    }

    fn transition(&mut self, task_id: &str, iteration: u32, from: LoopState, to: LoopState, note: Option<String>) {
        obs::emit_loop_transition(task_id, iteration, &from.to_string(), &to.to_string());
        self.final_state = to;
        self.transitions.push(LoopTransition {
            iteration,
            from,
            to,
            note,
        });
    }

    fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How a generator or critic call ended inside one iteration.
enum Attempt {
    Accepted(Value),
    /// Retryable failure; consumes the iteration.
    Failed(String),
    /// Non-retryable failure; ends the loop.
    Fatal(ResultEnvelope),
}

#[derive(Debug, Clone)]
pub struct QualityGateLoop {
    generator: Step,
    critic: Step,
    max_iterations: u32,
}

impl QualityGateLoop {
    /// A generator step writing to `output`.
    pub fn generator_step(skill_id: impl Into<String>, input_template: Value) -> Step {
        Step::new(skill_id, input_template, OUTPUT_KEY)
    }

    /// A critic step writing to `verdict`.
    pub fn critic_step(skill_id: impl Into<String>, input_template: Value) -> Step {
        Step::new(skill_id, input_template, VERDICT_KEY)
    }

    /// # Errors
    ///
    /// [`ForemanError::InvalidComposition`] when `max_iterations` is zero,
    /// the steps do not write `output` and `verdict`, or a template reads a
    /// key the loop does not provide.
    pub fn new(generator: Step, critic: Step, max_iterations: u32) -> ForemanResult<Self> {
        if max_iterations == 0 {
            return Err(ForemanError::InvalidComposition(
                "quality gate max_iterations must be at least 1".into(),
            ));
        }
        if generator.output_key != OUTPUT_KEY {
            return Err(ForemanError::InvalidComposition(format!(
                "quality gate generator must write {OUTPUT_KEY:?}, not {:?}",
                generator.output_key
            )));
        }
        if critic.output_key != VERDICT_KEY {
            return Err(ForemanError::InvalidComposition(format!(
                "quality gate critic must write {VERDICT_KEY:?}, not {:?}",
                critic.output_key
            )));
        }
        let generator_reads = BTreeSet::from([INPUT_KEY, VERDICT_KEY, ITERATION_KEY]);
        check_reads(&generator.skill_id, &generator.input_template, &generator_reads)?;
        let critic_reads = BTreeSet::from([INPUT_KEY, OUTPUT_KEY, ITERATION_KEY]);
        check_reads(&critic.skill_id, &critic.input_template, &critic_reads)?;

        Ok(Self {
            generator,
            critic,
            max_iterations,
        })
    }

    pub fn generator(&self) -> &Step {
        &self.generator
    }

    pub fn critic(&self) -> &Step {
        &self.critic
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run at most `max_iterations` generate/critique rounds.
    ///
    /// PASS ends the loop `COMPLETE` with the last output. Exhaustion ends it
    /// `IN_PROGRESS`, or `BLOCKED` when the last verdict says
    /// `"recoverable": false`; the result then carries the last output and
    /// verdict. A malformed verdict counts as FAIL.
    #[instrument(skip_all, fields(task_id = %ctx.task_id, max_iterations = self.max_iterations))]
    pub async fn run(&self, ctx: &RunContext<'_>, state: &mut SharedState) -> ResultEnvelope {
        if let (Some(output), Some(verdict)) = (
            ctx.reusable(&self.generator),
            ctx.reusable(&self.critic),
        ) {
            return self.resume_passed(ctx, state, output, verdict);
        }

        let mut report = LoopReport::new(self.max_iterations);
        let mut feedback = Value::Null;

        for iteration in 1..=self.max_iterations {
            METRICS.inc_loop_iterations();
            report.iterations = iteration;
            if iteration > 1 {
                report.transition(ctx.task_id, iteration, LoopState::Retry, LoopState::Generate, None);
            }

            let mut scope = state.fork();
            let seeded = scope
                .put(VERDICT_KEY, feedback.clone())
                .and_then(|_| scope.put(ITERATION_KEY, json!(iteration)));
            if let Err(e) = seeded {
                return self.abort(ctx, &mut report, iteration, LoopState::Generate, ResultEnvelope::from_error(&e));
            }

            let output = match self.attempt(ctx, &scope, &self.generator, iteration).await {
                Attempt::Accepted(output) => output,
                Attempt::Fatal(failed) => {
                    return self.abort(ctx, &mut report, iteration, LoopState::Generate, failed)
                }
                Attempt::Failed(reason) => {
                    let verdict = Verdict::fail(format!("generator failed: {reason}"));
                    feedback = serde_json::to_value(&verdict).unwrap_or(Value::Null);
                    report.last_verdict = Some(verdict);
                    let next = self.after_fail(iteration);
                    report.transition(ctx.task_id, iteration, LoopState::Generate, next, Some(reason));
                    continue;
                }
            };
            report.last_output = Some(output.clone());
            report.transition(ctx.task_id, iteration, LoopState::Generate, LoopState::Critique, None);

            // The critic sees this iteration's output, never a stale verdict.
            let mut critique_scope = state.fork();
            let seeded = critique_scope
                .put(OUTPUT_KEY, output.clone())
                .and_then(|_| critique_scope.put(ITERATION_KEY, json!(iteration)));
            if let Err(e) = seeded {
                return self.abort(ctx, &mut report, iteration, LoopState::Critique, ResultEnvelope::from_error(&e));
            }

            let (verdict, raw) = match self.attempt(ctx, &critique_scope, &self.critic, iteration).await {
                Attempt::Accepted(raw) => match serde_json::from_value::<Verdict>(raw.clone()) {
                    Ok(verdict) => (verdict, raw),
                    Err(e) => {
                        let warning = format!("iteration {iteration}: malformed verdict treated as FAIL: {e}");
                        warn!(task_id = %ctx.task_id, iteration, error = %e, "malformed verdict treated as FAIL");
                        report.warnings.push(warning);
                        let verdict = Verdict::fail(format!("malformed verdict: {e}"));
                        let raw = serde_json::to_value(&verdict).unwrap_or(Value::Null);
                        (verdict, raw)
                    }
                },
                Attempt::Failed(reason) => {
                    let verdict = Verdict::fail(format!("critic failed: {reason}"));
                    let raw = serde_json::to_value(&verdict).unwrap_or(Value::Null);
                    (verdict, raw)
                }
                Attempt::Fatal(failed) => {
                    return self.abort(ctx, &mut report, iteration, LoopState::Critique, failed)
                }
            };

            if verdict.is_pass() {
                report.last_verdict = Some(verdict);
                report.transition(ctx.task_id, iteration, LoopState::Critique, LoopState::Escalate, None);
                return self.finish_passed(state, report, output, raw);
            }

            let next = self.after_fail(iteration);
            report.transition(ctx.task_id, iteration, LoopState::Critique, next, verdict.reason.clone());
            report.last_verdict = Some(verdict);
            feedback = raw;
        }

        self.finish_exhausted(report)
    }

    fn after_fail(&self, iteration: u32) -> LoopState {
        if iteration < self.max_iterations {
            LoopState::Retry
        } else {
            LoopState::Exhausted
        }
    }

    async fn attempt(&self, ctx: &RunContext<'_>, scope: &SharedState, step: &Step, iteration: u32) -> Attempt {
        let input = match scope.resolve_template(&step.input_template) {
            Ok(input) => input,
            Err(e) => return Attempt::Fatal(ResultEnvelope::from_error(&e)),
        };
        let sub_task = format!("{}#{iteration}", ctx.sub_task_id(&step.output_key));
        let envelope = ctx.dispatcher.dispatch(&sub_task, &step.skill_id, input).await;
        if envelope.is_success() {
            return Attempt::Accepted(envelope.result.unwrap_or(Value::Null));
        }
        match envelope.error_kind {
            Some(ErrorKind::SchemaValidation) | Some(ErrorKind::Configuration) => Attempt::Fatal(envelope),
            _ => Attempt::Failed(
                envelope
                    .reason
                    .unwrap_or_else(|| format!("{} failed", step.skill_id)),
            ),
        }
    }

    fn abort(
        &self,
        ctx: &RunContext<'_>,
        report: &mut LoopReport,
        iteration: u32,
        from: LoopState,
        failed: ResultEnvelope,
    ) -> ResultEnvelope {
        report.transition(ctx.task_id, iteration, from, LoopState::Blocked, failed.reason.clone());
        let mut failed = failed.with_metadata("quality_gate", report.to_json());
        failed.completion_promise = CompletionPromise::Blocked;
        failed
    }

    fn finish_passed(&self, state: &mut SharedState, report: LoopReport, output: Value, verdict: Value) -> ResultEnvelope {
        let committed = state
            .put(OUTPUT_KEY, output.clone())
            .and_then(|_| state.put(VERDICT_KEY, verdict.clone()));
        if let Err(e) = committed {
            return ResultEnvelope::from_error(&e).with_metadata("quality_gate", report.to_json());
        }
        let records = vec![
            StepRecord::from_envelope(OUTPUT_KEY, &self.generator.skill_id, &ResultEnvelope::success(output.clone())),
            StepRecord::from_envelope(VERDICT_KEY, &self.critic.skill_id, &ResultEnvelope::success(verdict)),
        ];
        ResultEnvelope::success(output)
            .with_steps(records)
            .with_metadata("quality_gate", report.to_json())
    }

    fn finish_exhausted(&self, report: LoopReport) -> ResultEnvelope {
        let unrecoverable = report
            .last_verdict
            .as_ref()
            .is_some_and(|v| v.recoverable == Some(false));
        let promise = if unrecoverable {
            CompletionPromise::Blocked
        } else {
            CompletionPromise::InProgress
        };
        let reason = report
            .last_verdict
            .as_ref()
            .and_then(|v| v.reason.clone())
            .unwrap_or_else(|| "critic never returned PASS".to_string());
        let err = ForemanError::LoopExhausted {
            iterations: report.iterations,
            reason,
        };

        let mut records = Vec::new();
        if let Some(output) = &report.last_output {
            records.push(StepRecord {
                output_key: OUTPUT_KEY.to_string(),
                skill_id: self.generator.skill_id.clone(),
                status: EnvelopeStatus::Success,
                completion_promise: CompletionPromise::InProgress,
                result: Some(output.clone()),
                reason: None,
            });
        }

        let mut envelope = ResultEnvelope::error(err.to_string(), promise)
            .with_error_kind(err.kind())
            .with_steps(records)
            .with_metadata("quality_gate", report.to_json());
        envelope.result = Some(json!({
            OUTPUT_KEY: report.last_output,
            VERDICT_KEY: report.last_verdict,
        }));
        envelope
    }

    fn resume_passed(
        &self,
        ctx: &RunContext<'_>,
        state: &mut SharedState,
        output: &StepRecord,
        verdict: &StepRecord,
    ) -> ResultEnvelope {
        let value = output.result.clone().unwrap_or(Value::Null);
        let committed = state
            .put(OUTPUT_KEY, value.clone())
            .and_then(|_| state.put(VERDICT_KEY, verdict.result.clone().unwrap_or(Value::Null)));
        if let Err(e) = committed {
            return ResultEnvelope::from_error(&e);
        }
        for key in [OUTPUT_KEY, VERDICT_KEY] {
            METRICS.inc_steps_skipped();
            obs::emit_step_skipped(ctx.task_id, key);
        }
        ResultEnvelope::success(value).with_steps(vec![output.clone(), verdict.clone()])
    }
}
