//! Worker seam and the contract-enforcing dispatcher.
//!
//! Workers are opaque: the core only sees a skill id, an awaitable call and
//! the envelope it returns. Every call goes through [`Dispatcher`], which
//! validates the input before the worker runs and the output before any
//! runner sees it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::contract::ContractRegistry;
use crate::envelope::{ResultEnvelope, TaskEnvelope};
use crate::error::{Direction, ErrorKind, ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;

/// An executor for exactly one skill.
#[async_trait]
pub trait Worker: Send + Sync {
    fn skill_id(&self) -> &str;

    /// Execute the task. `Err` is reserved for transport faults; a worker
    /// that ran and failed returns an envelope with `status = error`.
    async fn call(&self, task: &TaskEnvelope) -> ForemanResult<ResultEnvelope>;
}

/// Adapts an async closure into a [`Worker`].
///
/// ```ignore
/// let echo = FnWorker::new("echo", |task: TaskEnvelope| async move {
///     Ok(ResultEnvelope::success(task.input))
/// });
/// ```
pub struct FnWorker<F> {
    skill_id: String,
    handler: F,
}

impl<F, Fut> FnWorker<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForemanResult<ResultEnvelope>> + Send + 'static,
{
    pub fn new(skill_id: impl Into<String>, handler: F) -> Self {
        Self {
            skill_id: skill_id.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(TaskEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ForemanResult<ResultEnvelope>> + Send + 'static,
{
    fn skill_id(&self) -> &str {
        &self.skill_id
    }

    async fn call(&self, task: &TaskEnvelope) -> ForemanResult<ResultEnvelope> {
        (self.handler)(task.clone()).await
    }
}

/// Workers indexed by skill id. One worker per skill.
#[derive(Default, Clone)]
pub struct WorkerSet {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// [`ForemanError::DuplicateWorker`] if the skill already has a worker.
    pub fn register(&mut self, worker: Arc<dyn Worker>) -> ForemanResult<()> {
        let skill_id = worker.skill_id().to_string();
        if self.workers.contains_key(&skill_id) {
            return Err(ForemanError::DuplicateWorker(skill_id));
        }
        self.workers.insert(skill_id, worker);
        Ok(())
    }

    pub fn get(&self, skill_id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(skill_id).cloned()
    }

    pub fn contains(&self, skill_id: &str) -> bool {
        self.workers.contains_key(skill_id)
    }

    pub fn skills(&self) -> Vec<String> {
        let mut skills: Vec<String> = self.workers.keys().cloned().collect();
        skills.sort();
        skills
    }
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("skills", &self.skills())
            .finish()
    }
}

/// One unit of a composition: which skill to call, how to build its input
/// from shared state, and where to store its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub skill_id: String,
    pub input_template: Value,
    pub output_key: String,
}

impl Step {
    pub fn new(skill_id: impl Into<String>, input_template: Value, output_key: impl Into<String>) -> Self {
        Self {
            skill_id: skill_id.into(),
            input_template,
            output_key: output_key.into(),
        }
    }
}

/// The only path from a runner to a worker.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    contracts: Arc<ContractRegistry>,
    workers: Arc<WorkerSet>,
    worker_timeout: Duration,
}

impl Dispatcher {
    pub fn new(contracts: Arc<ContractRegistry>, workers: Arc<WorkerSet>, worker_timeout: Duration) -> Self {
        Self {
            contracts,
            workers,
            worker_timeout,
        }
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn workers(&self) -> &WorkerSet {
        &self.workers
    }

    pub fn worker_timeout(&self) -> Duration {
        self.worker_timeout
    }

    /// Validate, call and validate again. Never returns `Err`: every failure
    /// is folded into an error envelope carrying an [`ErrorKind`].
    ///
    /// No worker is invoked when the input violates the skill's contract.
    pub async fn dispatch(&self, task_id: &str, skill_id: &str, input: Value) -> ResultEnvelope {
        if let Err(violations) = self.contracts.validate_input(skill_id, &input) {
            let err = ForemanError::SchemaValidation {
                skill_id: skill_id.to_string(),
                direction: Direction::Input,
                violations,
            };
            warn!(task_id = %task_id, skill_id = %skill_id, error = %err, "input rejected before dispatch");
            return ResultEnvelope::from_error(&err);
        }

        let Some(worker) = self.workers.get(skill_id) else {
            return ResultEnvelope::from_error(&ForemanError::MissingWorker(skill_id.to_string()));
        };

        let task = TaskEnvelope::new(task_id, skill_id, input);
        METRICS.inc_steps_dispatched();
        obs::emit_step_dispatched(task_id, skill_id);
        let start = Instant::now();

        let envelope = match tokio::time::timeout(self.worker_timeout, worker.call(&task)).await {
            Err(_) => {
                METRICS.inc_worker_timeouts();
                ResultEnvelope::from_error(&ForemanError::WorkerTimeout {
                    skill_id: skill_id.to_string(),
                    timeout: self.worker_timeout,
                })
            }
            Ok(Err(e)) => ResultEnvelope::from_error(&ForemanError::WorkerExecution {
                skill_id: skill_id.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(envelope)) => self.check_returned(skill_id, envelope),
        };

        obs::emit_step_finished(
            task_id,
            skill_id,
            start.elapsed().as_millis() as u64,
            envelope.status,
            envelope.completion_promise,
        );
        envelope
    }

    fn check_returned(&self, skill_id: &str, envelope: ResultEnvelope) -> ResultEnvelope {
        let output_violation = |violations| {
            ResultEnvelope::from_error(&ForemanError::SchemaValidation {
                skill_id: skill_id.to_string(),
                direction: Direction::Output,
                violations,
            })
        };

        if let Err(violations) = envelope.validate_shape() {
            return output_violation(violations);
        }

        if envelope.is_success() {
            let result = envelope.result.as_ref().unwrap_or(&Value::Null);
            if let Err(violations) = self.contracts.validate_output(skill_id, result) {
                return output_violation(violations);
            }
            return envelope;
        }

        if envelope.error_kind.is_none() {
            return envelope.with_error_kind(ErrorKind::WorkerExecution);
        }
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{FieldShape, Schema};
    use crate::envelope::{CompletionPromise, EnvelopeStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn contracts() -> Arc<ContractRegistry> {
        let mut reg = ContractRegistry::new();
        reg.register(
            "upper",
            Schema::new().required("text", FieldShape::String),
            Schema::new().required("text", FieldShape::String),
        )
        .unwrap();
        Arc::new(reg)
    }

    fn dispatcher_with(worker: Arc<dyn Worker>, timeout: Duration) -> Dispatcher {
        let mut workers = WorkerSet::new();
        workers.register(worker).unwrap();
        Dispatcher::new(contracts(), Arc::new(workers), timeout)
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let worker = Arc::new(FnWorker::new("upper", |task: TaskEnvelope| async move {
            let text = task.input["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(ResultEnvelope::success(json!({ "text": text })))
        }));
        let d = dispatcher_with(worker, Duration::from_secs(5));
        let env = d.dispatch("t/1", "upper", json!({"text": "abc"})).await;
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.result.unwrap()["text"], "ABC");
    }

    #[tokio::test]
    async fn test_invalid_input_never_reaches_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let worker = Arc::new(FnWorker::new("upper", move |_task: TaskEnvelope| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ResultEnvelope::success(json!({"text": "x"})))
            }
        }));
        let d = dispatcher_with(worker, Duration::from_secs(5));
        let env = d.dispatch("t/1", "upper", json!({"txt": "abc"})).await;
        assert_eq!(env.error_kind, Some(ErrorKind::SchemaValidation));
        assert_eq!(env.completion_promise, CompletionPromise::Blocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_output_is_rejected() {
        let worker = Arc::new(FnWorker::new("upper", |_task: TaskEnvelope| async move {
            Ok(ResultEnvelope::success(json!({"shout": "ABC"})))
        }));
        let d = dispatcher_with(worker, Duration::from_secs(5));
        let env = d.dispatch("t/1", "upper", json!({"text": "abc"})).await;
        assert_eq!(env.error_kind, Some(ErrorKind::SchemaValidation));
        assert!(env.reason.unwrap().contains("output for skill upper"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_worker_times_out() {
        let worker = Arc::new(FnWorker::new("upper", |_task: TaskEnvelope| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(ResultEnvelope::success(json!({"text": "late"})))
        }));
        let d = dispatcher_with(worker, Duration::from_secs(1));
        let env = d.dispatch("t/1", "upper", json!({"text": "abc"})).await;
        assert_eq!(env.error_kind, Some(ErrorKind::WorkerTimeout));
        assert_eq!(env.status, EnvelopeStatus::Error);
    }

    #[tokio::test]
    async fn test_worker_error_keeps_reason_and_gets_kind() {
        let worker = Arc::new(FnWorker::new("upper", |_task: TaskEnvelope| async move {
            Ok(ResultEnvelope::error("quota exceeded", CompletionPromise::InProgress))
        }));
        let d = dispatcher_with(worker, Duration::from_secs(5));
        let env = d.dispatch("t/1", "upper", json!({"text": "abc"})).await;
        assert_eq!(env.reason.as_deref(), Some("quota exceeded"));
        assert_eq!(env.completion_promise, CompletionPromise::InProgress);
        assert_eq!(env.error_kind, Some(ErrorKind::WorkerExecution));
    }

    #[tokio::test]
    async fn test_transport_fault_becomes_worker_execution_error() {
        let worker = Arc::new(FnWorker::new("upper", |_task: TaskEnvelope| async move {
            Err(ForemanError::Transport("connection reset".into()))
        }));
        let d = dispatcher_with(worker, Duration::from_secs(5));
        let env = d.dispatch("t/1", "upper", json!({"text": "abc"})).await;
        assert_eq!(env.error_kind, Some(ErrorKind::WorkerExecution));
        assert!(env.reason.unwrap().contains("connection reset"));
    }

    #[test]
    fn test_duplicate_worker_rejected() {
        let mut set = WorkerSet::new();
        let make = || {
            Arc::new(FnWorker::new("upper", |_t: TaskEnvelope| async move {
                Ok(ResultEnvelope::success(json!({})))
            })) as Arc<dyn Worker>
        };
        set.register(make()).unwrap();
        assert!(matches!(
            set.register(make()),
            Err(ForemanError::DuplicateWorker(s)) if s == "upper"
        ));
    }
}
