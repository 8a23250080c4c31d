//! Plan files: the JSON description of contracts, worker commands and
//! compositions a `foreman` invocation runs with.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use foreman_core::{
    ActionDescriptor, AggregationPolicy, Approver, AttemptStore, AuditLog, Composition, Foreman,
    ForemanConfig, ParallelFanOut, QualityGateLoop, RiskPolicy, Step, WorkerContract,
};

use crate::command_worker::CommandWorker;

/// An external program serving one skill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub skill_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Generator or critic of a quality gate. The output key is implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStep {
    pub skill_id: String,
    pub input_template: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompositionSpec {
    Single {
        skill_id: String,
    },
    Sequential {
        skill_id: String,
        steps: Vec<Step>,
    },
    Parallel {
        skill_id: String,
        branches: Vec<Step>,
        aggregator: Step,
        #[serde(default)]
        policy: Option<AggregationPolicy>,
    },
    QualityGate {
        skill_id: String,
        generator: LoopStep,
        critic: LoopStep,
        max_iterations: u32,
    },
    ApprovalGated {
        skill_id: String,
        action: Step,
        descriptor: ActionDescriptor,
    },
}

impl CompositionSpec {
    pub fn skill_id(&self) -> &str {
        match self {
            Self::Single { skill_id }
            | Self::Sequential { skill_id, .. }
            | Self::Parallel { skill_id, .. }
            | Self::QualityGate { skill_id, .. }
            | Self::ApprovalGated { skill_id, .. } => skill_id,
        }
    }
}

/// A complete plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub config: ForemanConfig,
    pub contracts: Vec<WorkerContract>,
    #[serde(default)]
    pub workers: Vec<WorkerCommand>,
    pub compositions: Vec<CompositionSpec>,
    /// Rules for approval-gated compositions. Defaults to the standard table.
    #[serde(default)]
    pub risk_policy: Option<RiskPolicy>,
}

/// Runtime collaborators a plan cannot describe.
pub struct Wiring {
    pub approver: Arc<dyn Approver>,
    pub attempts: Option<Arc<dyn AttemptStore>>,
    pub audit: AuditLog,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read plan {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid plan {}", path.display()))
    }

    pub fn risk_policy(&self) -> RiskPolicy {
        self.risk_policy.clone().unwrap_or_else(RiskPolicy::standard)
    }

    /// Build the foreman this plan describes.
    pub fn into_foreman(self, wiring: Wiring) -> Result<Foreman> {
        let policy = self.risk_policy();
        let mut builder = Foreman::builder().config(self.config).audit_log(wiring.audit);
        if let Some(store) = wiring.attempts {
            builder = builder.attempt_store(store);
        }
        for contract in self.contracts {
            builder = builder.register_contract(contract)?;
        }
        for worker in self.workers {
            builder = builder.worker(Arc::new(CommandWorker::new(
                worker.skill_id,
                worker.command,
                worker.args,
            )))?;
        }
        for spec in self.compositions {
            let skill_id = spec.skill_id().to_string();
            let composition = match spec {
                CompositionSpec::Single { skill_id } => Composition::single(skill_id),
                CompositionSpec::Sequential { steps, .. } => {
                    Composition::Sequential(foreman_core::SequentialPipeline::new(steps)?)
                }
                CompositionSpec::Parallel {
                    branches,
                    aggregator,
                    policy,
                    ..
                } => {
                    let mut fan_out = ParallelFanOut::new(branches, aggregator)?;
                    if let Some(policy) = policy {
                        fan_out = fan_out.with_policy(policy);
                    }
                    Composition::Parallel(fan_out)
                }
                CompositionSpec::QualityGate {
                    generator,
                    critic,
                    max_iterations,
                    ..
                } => Composition::QualityGate(QualityGateLoop::new(
                    QualityGateLoop::generator_step(generator.skill_id, generator.input_template),
                    QualityGateLoop::critic_step(critic.skill_id, critic.input_template),
                    max_iterations,
                )?),
                CompositionSpec::ApprovalGated {
                    action, descriptor, ..
                } => Composition::ApprovalGated(foreman_core::ApprovalGate::new(
                    action,
                    descriptor,
                    policy.clone(),
                    Arc::clone(&wiring.approver),
                )?),
            };
            builder = builder
                .composition(&skill_id, composition)
                .with_context(|| format!("composition for {skill_id}"))?;
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::StaticApprover;
    use serde_json::json;

    fn plan_json() -> Value {
        json!({
            "config": {"worker_timeout": 30, "aggregation": "allow_partial"},
            "contracts": [
                {"skill_id": "report", "input_schema": {}, "output_schema": {}},
                {"skill_id": "fetch", "input_schema": {}, "output_schema": {}},
                {"skill_id": "render", "input_schema": {}, "output_schema": {}}
            ],
            "workers": [
                {"skill_id": "fetch", "command": "fetch-data"},
                {"skill_id": "render", "command": "render-page", "args": ["--html"]}
            ],
            "compositions": [
                {
                    "kind": "sequential",
                    "skill_id": "report",
                    "steps": [
                        {"skill_id": "fetch", "input_template": {"q": "{input.q}"}, "output_key": "raw"},
                        {"skill_id": "render", "input_template": "{raw}", "output_key": "page"}
                    ]
                }
            ]
        })
    }

    fn wiring() -> Wiring {
        Wiring {
            approver: Arc::new(StaticApprover::approving("test")),
            attempts: None,
            audit: AuditLog::new(),
        }
    }

    #[test]
    fn test_plan_parses_and_builds() {
        let plan: Plan = serde_json::from_value(plan_json()).unwrap();
        assert_eq!(plan.config.aggregation, AggregationPolicy::AllowPartial);
        assert_eq!(plan.config.worker_timeout.as_secs(), 30);
        assert_eq!(plan.risk_policy(), RiskPolicy::standard());

        let foreman = plan.into_foreman(wiring()).unwrap();
        assert_eq!(foreman.skills(), vec!["report".to_string()]);
    }

    #[test]
    fn test_step_without_worker_is_rejected() {
        let mut raw = plan_json();
        raw["workers"] = json!([{"skill_id": "fetch", "command": "fetch-data"}]);
        let plan: Plan = serde_json::from_value(raw).unwrap();
        let err = plan.into_foreman(wiring()).unwrap_err();
        assert!(err.to_string().contains("render"), "{err}");
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Plan::load(&path).unwrap_err();
        assert!(err.to_string().contains("plan.json"));
    }
}
