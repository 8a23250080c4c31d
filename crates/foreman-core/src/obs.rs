//! Structured lifecycle events for orchestration runs.
//!
//! Every event is a single `info!` line with an `event` field, so a JSON
//! subscriber (see [`crate::telemetry`]) yields one greppable record per
//! transition.

use tracing::info;

use crate::envelope::{CompletionPromise, EnvelopeStatus};

/// Span covering one orchestration run. Attach it with
/// [`tracing::Instrument`] so it stays correct across await points.
///
/// ```ignore
/// foreman.execute(task).instrument(run_span("task-42", "report.write")).await
/// // every event below is tagged with task_id and skill_id
/// ```
pub fn run_span(task_id: &str, skill_id: &str) -> tracing::Span {
    tracing::info_span!("foreman.run", task_id = %task_id, skill_id = %skill_id)
}

pub fn emit_run_started(task_id: &str, skill_id: &str, resumed: bool) {
    info!(event = "run.started", task_id = %task_id, skill_id = %skill_id, resumed = resumed);
}

pub fn emit_run_finished(
    task_id: &str,
    duration_ms: u64,
    status: EnvelopeStatus,
    promise: CompletionPromise,
) {
    info!(
        event = "run.finished",
        task_id = %task_id,
        duration_ms = duration_ms,
        status = ?status,
        completion_promise = %promise,
    );
}

pub fn emit_step_dispatched(task_id: &str, skill_id: &str) {
    info!(event = "step.dispatched", task_id = %task_id, skill_id = %skill_id);
}

pub fn emit_step_finished(
    task_id: &str,
    skill_id: &str,
    duration_ms: u64,
    status: EnvelopeStatus,
    promise: CompletionPromise,
) {
    info!(
        event = "step.finished",
        task_id = %task_id,
        skill_id = %skill_id,
        duration_ms = duration_ms,
        status = ?status,
        completion_promise = %promise,
    );
}

/// A step was satisfied from the previous attempt.
pub fn emit_step_skipped(task_id: &str, output_key: &str) {
    info!(event = "step.skipped", task_id = %task_id, output_key = %output_key);
}

pub fn emit_loop_transition(task_id: &str, iteration: u32, from: &str, to: &str) {
    info!(
        event = "loop.transition",
        task_id = %task_id,
        iteration = iteration,
        from = %from,
        to = %to,
    );
}

pub fn emit_approval_decided(task_id: &str, risk: &str, outcome: &str, approver: &str) {
    info!(
        event = "approval.decided",
        task_id = %task_id,
        risk = %risk,
        outcome = %outcome,
        approver = %approver,
    );
}

/// Persisting an attempt failed; the run result is still returned.
pub fn emit_attempt_store_error(task_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "attempt.store_error", task_id = %task_id, error = %error);
}
