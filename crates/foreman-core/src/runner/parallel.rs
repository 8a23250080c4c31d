//! Parallel fan-out followed by a single aggregator step.
//!
//! Branches are independent: each gets an owned, pre-resolved input and runs
//! in its own tokio task, so no branch can observe another's writes. Results
//! are committed to shared state only after every branch has finished.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use super::{check_output_keys, check_reads, commit, run_step, Resolution, Resume, RunContext};
use crate::config::{AggregationPolicy, ForemanConfig};
use crate::envelope::{ResultEnvelope, StepRecord};
use crate::error::{ErrorKind, ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::state::{SharedState, INPUT_KEY};
use crate::worker::Step;

/// Aggregator result field that accepts partial branch data.
pub const ACCEPT_PARTIAL_FIELD: &str = "accept_partial";

#[derive(Debug, Clone)]
pub struct ParallelFanOut {
    branches: Vec<Step>,
    aggregator: Step,
    policy: Option<AggregationPolicy>,
    max_concurrency: Option<usize>,
}

struct BranchFailure {
    output_key: String,
    reason: String,
    error_kind: Option<ErrorKind>,
}

impl ParallelFanOut {
    /// # Errors
    ///
    /// [`ForemanError::OutputKeyCollision`] if two branches, or a branch and
    /// the aggregator, share an output key. [`ForemanError::InvalidComposition`]
    /// if there are no branches, a branch reads anything but the task input,
    /// or the aggregator reads a key that is neither the input nor a branch.
    pub fn new(branches: Vec<Step>, aggregator: Step) -> ForemanResult<Self> {
        if branches.is_empty() {
            return Err(ForemanError::InvalidComposition(
                "fan-out needs at least one branch".into(),
            ));
        }
        check_output_keys(
            branches
                .iter()
                .chain(std::iter::once(&aggregator))
                .map(|s| s.output_key.as_str()),
        )?;

        let input_only: BTreeSet<&str> = BTreeSet::from([INPUT_KEY]);
        for branch in &branches {
            check_reads(&branch.skill_id, &branch.input_template, &input_only)?;
        }
        let mut visible = input_only;
        visible.extend(branches.iter().map(|b| b.output_key.as_str()));
        check_reads(&aggregator.skill_id, &aggregator.input_template, &visible)?;

        Ok(Self {
            branches,
            aggregator,
            policy: None,
            max_concurrency: None,
        })
    }

    pub fn with_policy(mut self, policy: AggregationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Limit the number of branches in flight. `0` is treated as `1`.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    /// Fill settings not chosen explicitly from the foreman configuration.
    pub(crate) fn inherit(mut self, config: &ForemanConfig) -> Self {
        self.policy = self.policy.or(Some(config.aggregation));
        self.max_concurrency = self.max_concurrency.or(config.max_concurrency);
        self
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy.unwrap_or_default()
    }

    pub fn branches(&self) -> &[Step] {
        &self.branches
    }

    pub fn aggregator(&self) -> &Step {
        &self.aggregator
    }

    /// Dispatch every branch concurrently, wait for all of them, then run the
    /// aggregator. On resumption completed branches are reused; the
    /// aggregator runs again.
    ///
    /// A failed branch never cancels its siblings. Its key is marked missing,
    /// so the aggregator receives `{"$missing": key, "reason": ...}` in its
    /// place. Unless the policy is [`AggregationPolicy::AllowPartial`] or the
    /// aggregator answers with `"accept_partial": true`, any branch failure
    /// blocks the run.
    #[instrument(skip_all, fields(task_id = %ctx.task_id, branches = self.branches.len()))]
    pub async fn run(&self, ctx: &RunContext<'_>, state: &mut SharedState) -> ResultEnvelope {
        let mut records: Vec<StepRecord> = Vec::with_capacity(self.branches.len() + 1);
        let mut failures: Vec<BranchFailure> = Vec::new();

        let mut pending: Vec<(&Step, Value)> = Vec::new();
        for branch in &self.branches {
            if let Some(record) = ctx.reusable(branch) {
                let value = record.result.clone().unwrap_or(Value::Null);
                if let Err(e) = state.put(&branch.output_key, value) {
                    return ResultEnvelope::from_error(&e).with_steps(records);
                }
                records.push(record.clone());
                METRICS.inc_steps_skipped();
                obs::emit_step_skipped(ctx.task_id, &branch.output_key);
                continue;
            }
            match state.resolve_template(&branch.input_template) {
                Ok(input) => pending.push((branch, input)),
                Err(e) => {
                    let failed = ResultEnvelope::from_error(&e);
                    records.push(StepRecord::from_envelope(&branch.output_key, &branch.skill_id, &failed));
                    failures.push(BranchFailure::from_envelope(&branch.output_key, &failed));
                }
            }
        }

        let semaphore = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n)));
        let handles: Vec<_> = pending
            .iter()
            .map(|(branch, input)| {
                let dispatcher = ctx.dispatcher.clone();
                let semaphore = semaphore.clone();
                let task_id = ctx.sub_task_id(&branch.output_key);
                let skill_id = branch.skill_id.clone();
                let input = input.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    dispatcher.dispatch(&task_id, &skill_id, input).await
                })
            })
            .collect();
        let joined = futures::future::join_all(handles).await;

        for ((branch, _), outcome) in pending.iter().zip(joined) {
            let envelope = outcome.unwrap_or_else(|join_err| {
                warn!(skill_id = %branch.skill_id, error = %join_err, "branch task aborted");
                ResultEnvelope::from_error(&ForemanError::WorkerExecution {
                    skill_id: branch.skill_id.clone(),
                    reason: format!("branch task aborted: {join_err}"),
                })
            });
            if let Err(failed) = commit(state, branch, envelope, &mut records) {
                failures.push(BranchFailure::from_envelope(&branch.output_key, &failed));
            }
        }

        for failure in &failures {
            if let Err(e) = state.mark_missing(&failure.output_key, &failure.reason) {
                return ResultEnvelope::from_error(&e).with_steps(records);
            }
        }

        // The aggregator always sees this attempt's branch data, so it is never resumed.
        let fresh = Resume::none();
        let aggregate_ctx = RunContext::new(ctx.task_id, ctx.dispatcher, &fresh);
        let aggregated = run_step(
            &aggregate_ctx,
            state,
            &self.aggregator,
            Resolution::Markers,
            &mut records,
        )
        .await;
        let failed_branches = failed_branches_json(&failures);

        let outcome = match aggregated {
            Ok(outcome) => outcome,
            Err(failed) => {
                let failed = failed.with_steps(records);
                return if failures.is_empty() {
                    failed
                } else {
                    failed.with_metadata("failed_branches", failed_branches)
                };
            }
        };

        if failures.is_empty() {
            let mut envelope = ResultEnvelope::success(outcome.value).with_steps(records);
            envelope.completion_promise = outcome.promise;
            return envelope;
        }

        let accepted = self.policy() == AggregationPolicy::AllowPartial
            || outcome.value.get(ACCEPT_PARTIAL_FIELD) == Some(&Value::Bool(true));
        if accepted {
            let mut envelope = ResultEnvelope::success(outcome.value)
                .with_steps(records)
                .with_metadata("failed_branches", failed_branches);
            envelope.completion_promise = outcome.promise;
            return envelope;
        }

        let keys: Vec<&str> = failures.iter().map(|f| f.output_key.as_str()).collect();
        let kind = failures
            .iter()
            .find_map(|f| f.error_kind)
            .unwrap_or(ErrorKind::WorkerExecution);
        ResultEnvelope::blocked(format!(
            "{} of {} branches failed ({}); aggregator did not accept partial data",
            failures.len(),
            self.branches.len(),
            keys.join(", ")
        ))
        .with_error_kind(kind)
        .with_steps(records)
        .with_metadata("failed_branches", failed_branches)
        .with_metadata("partial_result", outcome.value)
    }
}

impl BranchFailure {
    fn from_envelope(output_key: &str, envelope: &ResultEnvelope) -> Self {
        Self {
            output_key: output_key.to_string(),
            reason: envelope
                .reason
                .clone()
                .unwrap_or_else(|| "branch failed".to_string()),
            error_kind: envelope.error_kind,
        }
    }
}

fn failed_branches_json(failures: &[BranchFailure]) -> Value {
    Value::Array(
        failures
            .iter()
            .map(|f| {
                json!({
                    "output_key": f.output_key,
                    "reason": f.reason,
                    "error_kind": f.error_kind,
                })
            })
            .collect(),
    )
}
