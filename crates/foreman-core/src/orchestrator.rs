//! The foreman: one entry point that validates a task, picks its configured
//! composition, runs it and validates what comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{warn, Instrument};

use crate::approval::{Approver, AuditLog, RiskPolicy};
use crate::config::ForemanConfig;
use crate::contract::{ContractRegistry, Schema, WorkerContract};
use crate::envelope::{ResultEnvelope, TaskEnvelope};
use crate::error::{Direction, ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::persistence::AttemptStore;
use crate::runner::{
    run_step, ActionDescriptor, ApprovalGate, ParallelFanOut, QualityGateLoop, Resolution, Resume,
    RunContext, SequentialPipeline,
};
use crate::state::SharedState;
use crate::worker::{Dispatcher, Step, Worker, WorkerSet};

/// Output key of a single-call composition.
pub const SINGLE_OUTPUT_KEY: &str = "result";

/// How a top-level skill is executed. Chosen by configuration, never inferred
/// from the task content.
#[derive(Debug, Clone)]
pub enum Composition {
    /// Call the skill's own worker with the task input.
    Single(Step),
    Sequential(SequentialPipeline),
    Parallel(ParallelFanOut),
    QualityGate(QualityGateLoop),
    ApprovalGated(ApprovalGate),
}

impl Composition {
    /// A single call of `skill_id` with the unmodified task input.
    pub fn single(skill_id: impl Into<String>) -> Self {
        Self::Single(Step::new(skill_id, Value::String("{input}".into()), SINGLE_OUTPUT_KEY))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Sequential(_) => "sequential",
            Self::Parallel(_) => "parallel",
            Self::QualityGate(_) => "quality_gate",
            Self::ApprovalGated(_) => "approval_gated",
        }
    }

    /// Every step this composition may dispatch.
    pub fn steps(&self) -> Vec<&Step> {
        match self {
            Self::Single(step) => vec![step],
            Self::Sequential(p) => p.steps().iter().collect(),
            Self::Parallel(f) => f.branches().iter().chain(std::iter::once(f.aggregator())).collect(),
            Self::QualityGate(l) => vec![l.generator(), l.critic()],
            Self::ApprovalGated(g) => vec![g.action()],
        }
    }
}

/// Assembles a [`Foreman`].
#[derive(Default)]
pub struct ForemanBuilder {
    config: ForemanConfig,
    contracts: ContractRegistry,
    workers: WorkerSet,
    compositions: HashMap<String, Composition>,
    attempts: Option<Arc<dyn AttemptStore>>,
    audit: AuditLog,
}

impl ForemanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ForemanConfig) -> Self {
        self.config = config;
        self
    }

    pub fn contract(mut self, skill_id: impl Into<String>, input: Schema, output: Schema) -> ForemanResult<Self> {
        self.contracts.register(skill_id, input, output)?;
        Ok(self)
    }

    pub fn register_contract(mut self, contract: WorkerContract) -> ForemanResult<Self> {
        self.contracts.register_contract(contract)?;
        Ok(self)
    }

    pub fn worker(mut self, worker: Arc<dyn Worker>) -> ForemanResult<Self> {
        self.workers.register(worker)?;
        Ok(self)
    }

    /// Persist every final envelope and resume tasks that arrive without
    /// `previous_attempt` from the stored one.
    pub fn attempt_store(mut self, store: Arc<dyn AttemptStore>) -> Self {
        self.attempts = Some(store);
        self
    }

    /// Record approval decisions into `audit` instead of a fresh log.
    pub fn audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// # Errors
    ///
    /// [`ForemanError::InvalidComposition`] if `skill_id` already has one.
    pub fn composition(mut self, skill_id: impl Into<String>, composition: Composition) -> ForemanResult<Self> {
        let skill_id = skill_id.into();
        if self.compositions.contains_key(&skill_id) {
            return Err(ForemanError::InvalidComposition(format!(
                "skill {skill_id} already has a composition"
            )));
        }
        self.compositions.insert(skill_id, composition);
        Ok(self)
    }

    pub fn single(self, skill_id: impl Into<String>) -> ForemanResult<Self> {
        let skill_id = skill_id.into();
        let composition = Composition::single(skill_id.clone());
        self.composition(skill_id, composition)
    }

    pub fn sequential(self, skill_id: impl Into<String>, steps: Vec<Step>) -> ForemanResult<Self> {
        let pipeline = SequentialPipeline::new(steps)?;
        self.composition(skill_id, Composition::Sequential(pipeline))
    }

    pub fn parallel(self, skill_id: impl Into<String>, branches: Vec<Step>, aggregator: Step) -> ForemanResult<Self> {
        let fan_out = ParallelFanOut::new(branches, aggregator)?;
        self.composition(skill_id, Composition::Parallel(fan_out))
    }

    pub fn quality_gate(
        self,
        skill_id: impl Into<String>,
        generator: Step,
        critic: Step,
        max_iterations: u32,
    ) -> ForemanResult<Self> {
        let gate = QualityGateLoop::new(generator, critic, max_iterations)?;
        self.composition(skill_id, Composition::QualityGate(gate))
    }

    pub fn approval_gated(
        self,
        skill_id: impl Into<String>,
        action: Step,
        descriptor: ActionDescriptor,
        policy: RiskPolicy,
        approver: Arc<dyn Approver>,
    ) -> ForemanResult<Self> {
        let gate = ApprovalGate::new(action, descriptor, policy, approver)?;
        self.composition(skill_id, Composition::ApprovalGated(gate))
    }

    /// Check the wiring and produce a runnable foreman.
    ///
    /// # Errors
    ///
    /// Invalid configuration, a composed skill with no contract, or a step
    /// whose skill has no contract or no worker.
    pub fn build(self) -> ForemanResult<Foreman> {
        self.config.validate()?;

        for (skill_id, composition) in &self.compositions {
            if !self.contracts.contains(skill_id) {
                return Err(ForemanError::UnknownSkill(skill_id.clone()));
            }
            for step in composition.steps() {
                if !self.contracts.contains(&step.skill_id) {
                    return Err(ForemanError::UnknownSkill(step.skill_id.clone()));
                }
                if !self.workers.contains(&step.skill_id) {
                    return Err(ForemanError::MissingWorker(step.skill_id.clone()));
                }
            }
        }

        let config = self.config;
        let audit = self.audit;
        let compositions = self
            .compositions
            .into_iter()
            .map(|(skill_id, composition)| {
                let composition = match composition {
                    Composition::Parallel(f) => Composition::Parallel(f.inherit(&config)),
                    Composition::ApprovalGated(g) => Composition::ApprovalGated(g.inherit(&config, &audit)),
                    other => other,
                };
                (skill_id, composition)
            })
            .collect();

        let dispatcher = Dispatcher::new(
            Arc::new(self.contracts),
            Arc::new(self.workers),
            config.worker_timeout,
        );
        Ok(Foreman {
            config,
            dispatcher,
            compositions,
            attempts: self.attempts,
            audit,
        })
    }
}

/// Runs tasks against their configured compositions.
///
/// A foreman is immutable once built and can serve concurrent runs; each run
/// gets its own [`SharedState`].
pub struct Foreman {
    config: ForemanConfig,
    dispatcher: Dispatcher,
    compositions: HashMap<String, Composition>,
    attempts: Option<Arc<dyn AttemptStore>>,
    audit: AuditLog,
}

impl std::fmt::Debug for Foreman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Foreman")
            .field("config", &self.config)
            .field("skills", &self.skills())
            .field("persistent", &self.attempts.is_some())
            .finish()
    }
}

impl Foreman {
    pub fn builder() -> ForemanBuilder {
        ForemanBuilder::new()
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    pub fn contracts(&self) -> &ContractRegistry {
        self.dispatcher.contracts()
    }

    /// Every approval decision made by this foreman's gates.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Top-level skills with a composition, sorted.
    pub fn skills(&self) -> Vec<String> {
        let mut skills: Vec<String> = self.compositions.keys().cloned().collect();
        skills.sort();
        skills
    }

    pub fn composition(&self, skill_id: &str) -> Option<&Composition> {
        self.compositions.get(skill_id)
    }

    /// Execute one task. Never fails: every error is reported as an error
    /// envelope whose `task_id` is the task's.
    pub async fn run(&self, task: &TaskEnvelope) -> ResultEnvelope {
        let span = obs::run_span(&task.task_id, &task.skill_id);
        async {
            let start = Instant::now();
            obs::emit_run_started(&task.task_id, &task.skill_id, task.previous_attempt.is_some());

            let envelope = self.execute(task).await.with_task_id(&task.task_id);

            obs::emit_run_finished(
                &task.task_id,
                start.elapsed().as_millis() as u64,
                envelope.status,
                envelope.completion_promise,
            );
            if let Some(store) = &self.attempts {
                if let Err(e) = store.save(&envelope).await {
                    obs::emit_attempt_store_error(&task.task_id, &e);
                }
            }
            METRICS.flush();
            envelope
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, task: &TaskEnvelope) -> ResultEnvelope {
        let Some(composition) = self.compositions.get(&task.skill_id) else {
            return ResultEnvelope::from_error(&ForemanError::UnknownSkill(task.skill_id.clone()));
        };

        let contracts = self.dispatcher.contracts();
        if let Err(violations) = contracts.validate_input(&task.skill_id, &task.input) {
            return ResultEnvelope::from_error(&ForemanError::SchemaValidation {
                skill_id: task.skill_id.clone(),
                direction: Direction::Input,
                violations,
            });
        }

        let resume = self.resume_view(task).await;
        let mut state = SharedState::with_input(task.input.clone());
        let ctx = RunContext::new(&task.task_id, &self.dispatcher, &resume);

        let envelope = match composition {
            Composition::Single(step) => {
                let mut records = Vec::with_capacity(1);
                match run_step(&ctx, &mut state, step, Resolution::Strict, &mut records).await {
                    Ok(outcome) => {
                        let mut envelope = ResultEnvelope::success(outcome.value).with_steps(records);
                        envelope.completion_promise = outcome.promise;
                        envelope
                    }
                    Err(failed) => failed.with_steps(records),
                }
            }
            Composition::Sequential(pipeline) => pipeline.run(&ctx, &mut state).await,
            Composition::Parallel(fan_out) => fan_out.run(&ctx, &mut state).await,
            Composition::QualityGate(gate) => gate.run(&ctx, &mut state).await,
            Composition::ApprovalGated(gate) => gate.run(&ctx, &mut state).await,
        };

        if !envelope.is_success() {
            return envelope;
        }
        let result = envelope.result.as_ref().unwrap_or(&Value::Null);
        match contracts.validate_output(&task.skill_id, result) {
            Ok(()) => envelope,
            Err(violations) => {
                let mut rejected = ResultEnvelope::from_error(&ForemanError::SchemaValidation {
                    skill_id: task.skill_id.clone(),
                    direction: Direction::Output,
                    violations,
                })
                .with_steps(envelope.steps);
                rejected.metadata = envelope.metadata;
                rejected
            }
        }
    }

    /// The completed steps this run may reuse.
    ///
    /// An explicit `previous_attempt` wins over the attempt store. An attempt
    /// recorded for a different task id is ignored.
    async fn resume_view(&self, task: &TaskEnvelope) -> Resume {
        let previous = match &task.previous_attempt {
            Some(previous) => Some(previous.as_ref().clone()),
            None => match &self.attempts {
                Some(store) => store.load(&task.task_id).await.unwrap_or_else(|e| {
                    warn!(task_id = %task.task_id, error = %e, "could not load previous attempt");
                    None
                }),
                None => None,
            },
        };

        match previous {
            Some(previous) => match previous.task_id.as_deref() {
                Some(other) if other != task.task_id => {
                    warn!(
                        task_id = %task.task_id,
                        previous_task_id = %other,
                        "ignoring previous attempt recorded for a different task"
                    );
                    Resume::none()
                }
                _ => Resume::from_previous(&previous),
            },
            None => Resume::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::FieldShape;
    use crate::envelope::CompletionPromise;
    use crate::error::ErrorKind;
    use crate::worker::FnWorker;
    use serde_json::json;

    fn echo() -> Arc<dyn Worker> {
        Arc::new(FnWorker::new("echo", |task: TaskEnvelope| async move {
            Ok(ResultEnvelope::success(task.input))
        }))
    }

    fn text_schema() -> Schema {
        Schema::new().required("text", FieldShape::String)
    }

    #[test]
    fn test_build_requires_contract_for_composed_skill() {
        let err = Foreman::builder()
            .worker(echo())
            .unwrap()
            .single("echo")
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, ForemanError::UnknownSkill(s) if s == "echo"));
    }

    #[test]
    fn test_build_requires_worker_for_every_step() {
        let err = Foreman::builder()
            .contract("report", text_schema(), Schema::new())
            .unwrap()
            .contract("draft", text_schema(), Schema::new())
            .unwrap()
            .sequential("report", vec![Step::new("draft", json!("{input}"), "draft")])
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, ForemanError::MissingWorker(s) if s == "draft"));
    }

    #[test]
    fn test_duplicate_composition_rejected() {
        let result = Foreman::builder()
            .single("echo")
            .unwrap()
            .single("echo");
        assert!(matches!(result, Err(ForemanError::InvalidComposition(_))));
    }

    #[tokio::test]
    async fn test_single_call_round_trip() {
        let foreman = Foreman::builder()
            .contract("echo", text_schema(), text_schema())
            .unwrap()
            .worker(echo())
            .unwrap()
            .single("echo")
            .unwrap()
            .build()
            .unwrap();

        let env = foreman
            .run(&TaskEnvelope::new("t-1", "echo", json!({"text": "hi"})))
            .await;
        assert!(env.is_complete());
        assert_eq!(env.task_id.as_deref(), Some("t-1"));
        assert_eq!(env.result, Some(json!({"text": "hi"})));
        assert_eq!(env.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_skill_is_blocked() {
        let foreman = Foreman::builder().build().unwrap();
        let env = foreman.run(&TaskEnvelope::new("t-1", "nope", json!({}))).await;
        assert_eq!(env.completion_promise, CompletionPromise::Blocked);
        assert_eq!(env.error_kind, Some(ErrorKind::SchemaValidation));
    }

    #[tokio::test]
    async fn test_outbound_violation_is_reported() {
        let foreman = Foreman::builder()
            .contract("echo", Schema::new(), text_schema())
            .unwrap()
            .worker(echo())
            .unwrap()
            .single("echo")
            .unwrap()
            .build()
            .unwrap();
        let env = foreman
            .run(&TaskEnvelope::new("t-1", "echo", json!({"other": 1})))
            .await;
        assert_eq!(env.error_kind, Some(ErrorKind::SchemaValidation));
        assert!(env.reason.unwrap().contains("output for skill echo"));
    }
}
