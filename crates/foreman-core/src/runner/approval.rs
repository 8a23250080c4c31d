//! Risk-classified, approval-gated single action.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument};

use super::{check_output_keys, check_reads, run_step, Resolution, RunContext};
use crate::approval::{
    request_approval, ApprovalDecision, ApprovalOutcome, ApprovalRequest, Approver, AuditLog,
    RiskAssessment, RiskPolicy,
};
use crate::config::ForemanConfig;
use crate::envelope::ResultEnvelope;
use crate::error::{ForemanError, ForemanResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::state::{SharedState, INPUT_KEY};
use crate::worker::Step;

const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Metadata field holding the approval decision on the returned envelope.
pub const APPROVAL_METADATA: &str = "approval";

/// Describes the gated action for risk classification. Both fields are text
/// templates resolved against the task input, e.g. `"delete {input.table}"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action: String,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl ActionDescriptor {
    pub fn new<I, S>(action: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: action.into(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runs one action only after its risk level has been cleared.
///
/// `LOW` and `MEDIUM` are approved automatically; `HIGH` and `CRITICAL` wait
/// on the [`Approver`] for at most the rule's timeout (or the gate default).
/// Rejected and timed-out requests never reach the action's worker.
#[derive(Clone)]
pub struct ApprovalGate {
    action: Step,
    descriptor: ActionDescriptor,
    policy: RiskPolicy,
    approver: Arc<dyn Approver>,
    audit: AuditLog,
    approval_timeout: Option<Duration>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("action", &self.action)
            .field("descriptor", &self.descriptor)
            .field("rules", &self.policy.rules.len())
            .field("approval_timeout", &self.approval_timeout)
            .finish()
    }
}

impl ApprovalGate {
    pub fn new(
        action: Step,
        descriptor: ActionDescriptor,
        policy: RiskPolicy,
        approver: Arc<dyn Approver>,
    ) -> ForemanResult<Self> {
        check_output_keys([action.output_key.as_str()])?;
        let input_only = BTreeSet::from([INPUT_KEY]);
        check_reads(&action.skill_id, &action.input_template, &input_only)?;
        let descriptor_templates = json!({
            "action": descriptor.action,
            "resources": descriptor.resources,
        });
        check_reads(&action.skill_id, &descriptor_templates, &input_only)?;
        policy.validate()?;

        Ok(Self {
            action,
            descriptor,
            policy,
            approver,
            audit: AuditLog::new(),
            approval_timeout: None,
        })
    }

    /// Share an existing audit log instead of the gate's own.
    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    /// Timeout used when the matching risk rule does not set one.
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    /// Fill the timeout from the foreman configuration unless set, and
    /// record into the foreman's audit log.
    pub(crate) fn inherit(mut self, config: &ForemanConfig, audit: &AuditLog) -> Self {
        self.approval_timeout = self.approval_timeout.or(Some(config.approval_timeout));
        self.audit = audit.clone();
        self
    }

    pub fn action(&self) -> &Step {
        &self.action
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Resolve the descriptor and classify it.
    pub fn assess(&self, state: &SharedState) -> ForemanResult<(ApprovalRequest, RiskAssessment)> {
        let action = state.resolve_text(&self.descriptor.action)?;
        let resources = self
            .descriptor
            .resources
            .iter()
            .map(|r| state.resolve_text(r))
            .collect::<ForemanResult<Vec<_>>>()?;
        let assessment = self.policy.classify(&action, &resources);
        let timeout = self.timeout_for(&assessment);
        let request = ApprovalRequest::new(action, resources, assessment.level, timeout.as_secs());
        Ok((request, assessment))
    }

    /// Rule timeout, then the gate's (or foreman's) timeout, then the
    /// policy default.
    fn timeout_for(&self, assessment: &RiskAssessment) -> Duration {
        assessment
            .timeout_secs
            .map(Duration::from_secs)
            .or(self.approval_timeout)
            .or(self.policy.default_timeout_secs.map(Duration::from_secs))
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT)
    }

    #[instrument(skip_all, fields(task_id = %ctx.task_id, skill_id = %self.action.skill_id))]
    pub async fn run(&self, ctx: &RunContext<'_>, state: &mut SharedState) -> ResultEnvelope {
        let mut records = Vec::with_capacity(1);

        // Already executed in a previous attempt: approval is not asked again.
        if ctx.reusable(&self.action).is_some() {
            return match run_step(ctx, state, &self.action, Resolution::Strict, &mut records).await {
                Ok(outcome) => ResultEnvelope::success(outcome.value).with_steps(records),
                Err(failed) => failed.with_steps(records),
            };
        }

        let (request, assessment) = match self.assess(state) {
            Ok(assessed) => assessed,
            Err(e) => return ResultEnvelope::from_error(&e),
        };
        let timeout = self.timeout_for(&assessment);

        let decision = if request.risk_level.requires_approval() {
            METRICS.inc_approvals_requested();
            info!(
                risk = %request.risk_level,
                action = %request.action,
                timeout_secs = request.timeout_seconds,
                "awaiting approval"
            );
            request_approval(self.approver.as_ref(), &request, timeout).await
        } else {
            ApprovalDecision::auto(Utc::now())
        };

        let record = self.audit.append(ctx.task_id, request.clone(), decision.clone());
        obs::emit_approval_decided(
            ctx.task_id,
            &request.risk_level.to_string(),
            &decision.outcome.to_string(),
            &decision.approver,
        );
        let metadata = json!({
            "request_id": record.request_id,
            "risk_level": request.risk_level,
            "matched_rules": assessment.matched,
            "decision": decision,
        });

        let envelope = match decision.outcome {
            ApprovalOutcome::Approved => {
                match run_step(ctx, state, &self.action, Resolution::Strict, &mut records).await {
                    Ok(outcome) => {
                        let mut envelope = ResultEnvelope::success(outcome.value);
                        envelope.completion_promise = outcome.promise;
                        envelope
                    }
                    Err(failed) => failed,
                }
            }
            ApprovalOutcome::Rejected => ResultEnvelope::from_error(&ForemanError::ApprovalRejected {
                approver: decision.approver.clone(),
                reason: decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".into()),
            }),
            ApprovalOutcome::TimedOut => {
                ResultEnvelope::from_error(&ForemanError::ApprovalTimeout { timeout })
            }
        };
        envelope
            .with_steps(records)
            .with_metadata(APPROVAL_METADATA, metadata)
    }
}

/// The approval decision attached to an envelope by [`ApprovalGate::run`].
pub fn approval_decision(envelope: &ResultEnvelope) -> Option<ApprovalDecision> {
    envelope
        .metadata_field(APPROVAL_METADATA)
        .and_then(|m| m.get("decision"))
        .cloned()
        .and_then(|v: Value| serde_json::from_value(v).ok())
}
