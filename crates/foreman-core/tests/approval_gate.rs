//! Approval gate: risk classification, bounded waiting, audit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use foreman_core::{
    approval_decision, ActionDescriptor, ApprovalOutcome, Approver, ChannelApprover,
    CompletionPromise, ErrorKind, FieldShape, Foreman, ForemanConfig, ForemanResult, FnWorker,
    ResultEnvelope, RiskLevel, RiskPolicy, RiskRule, Schema, StaticApprover, Step, TaskEnvelope,
    Worker,
};

fn deploy_worker() -> (Arc<dyn Worker>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new("deploy", move |task: TaskEnvelope| {
        seen.fetch_add(1, Ordering::SeqCst);
        let service = task.input["service"].clone();
        async move { Ok(ResultEnvelope::success(json!({"deployed": service}))) }
    });
    (Arc::new(worker), calls)
}

fn policy() -> RiskPolicy {
    RiskPolicy::permissive()
        .with_rule(RiskRule::namespace("prod/", RiskLevel::Critical).with_timeout_secs(1))
        .with_rule(RiskRule::namespace("staging/", RiskLevel::High))
}

fn foreman(approver: Arc<dyn Approver>, worker: Arc<dyn Worker>) -> ForemanResult<Foreman> {
    let input = Schema::new()
        .required("service", FieldShape::String)
        .required("env", FieldShape::String);
    Foreman::builder()
        .config(ForemanConfig::default().with_approval_timeout(Duration::from_secs(5)))
        .contract("release", input, Schema::new())?
        .contract("deploy", Schema::new(), Schema::new().required("deployed", FieldShape::String))?
        .worker(worker)?
        .approval_gated(
            "release",
            Step::new("deploy", json!({"service": "{input.service}"}), "deployment"),
            ActionDescriptor::new("deploy {input.service}", ["{input.env}/{input.service}"]),
            policy(),
            approver,
        )?
        .build()
}

fn task(id: &str, env: &str) -> TaskEnvelope {
    TaskEnvelope::new(id, "release", json!({"service": "billing", "env": env}))
}

#[tokio::test(start_paused = true)]
async fn late_approval_times_out_and_never_runs_the_action() {
    let (worker, calls) = deploy_worker();
    let approver = Arc::new(StaticApprover::approving("alice").with_delay(Duration::from_secs(2)));
    let foreman = foreman(approver, worker).unwrap();

    let env = foreman.run(&task("t-1", "prod")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0, "action must not run without approval");
    assert_eq!(env.error_kind, Some(ErrorKind::ApprovalTimeout));
    assert_eq!(env.completion_promise, CompletionPromise::Blocked);

    let decision = approval_decision(&env).unwrap();
    assert_eq!(decision.outcome, ApprovalOutcome::TimedOut);
    assert_eq!(env.metadata_field("approval").unwrap()["risk_level"], "CRITICAL");

    let audit = foreman.audit_log().records();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].task_id, "t-1");
    assert_eq!(audit[0].request.timeout_seconds, 1);
    assert!(audit[0].verify_integrity());
}

#[tokio::test]
async fn approved_high_risk_action_runs() {
    let (worker, calls) = deploy_worker();
    let foreman = foreman(Arc::new(StaticApprover::approving("alice")), worker).unwrap();

    let env = foreman.run(&task("t-2", "staging")).await;

    assert!(env.is_complete(), "unexpected: {env:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(env.result, Some(json!({"deployed": "billing"})));
    let decision = approval_decision(&env).unwrap();
    assert_eq!(decision.approver, "alice");
    assert_eq!(foreman.audit_log().records()[0].request.timeout_seconds, 5);
}

#[tokio::test]
async fn rejection_blocks_with_reason() {
    let (worker, calls) = deploy_worker();
    let approver = Arc::new(StaticApprover::rejecting("bob", "change freeze"));
    let foreman = foreman(approver, worker).unwrap();

    let env = foreman.run(&task("t-3", "prod")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(env.error_kind, Some(ErrorKind::ApprovalRejected));
    assert_eq!(env.completion_promise, CompletionPromise::Blocked);
    let reason = env.reason.unwrap();
    assert!(reason.contains("bob"));
    assert!(reason.contains("change freeze"));
}

#[tokio::test]
async fn low_risk_action_is_approved_automatically() {
    let (worker, calls) = deploy_worker();
    let approver = Arc::new(StaticApprover::rejecting("bob", "should not be asked"));
    let foreman = foreman(approver, worker).unwrap();

    let env = foreman.run(&task("t-4", "dev")).await;

    assert!(env.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let decision = approval_decision(&env).unwrap();
    assert_eq!(decision.approver, "auto");
    assert_eq!(foreman.audit_log().len(), 1, "automatic decisions are audited too");
}

#[tokio::test]
async fn channel_approver_relays_human_decision() {
    let (worker, calls) = deploy_worker();
    let (approver, mut pending) = ChannelApprover::new(4);
    let foreman = foreman(Arc::new(approver), worker).unwrap();

    let responder = tokio::spawn(async move {
        let request = pending.recv().await.unwrap();
        assert_eq!(request.request.risk_level, RiskLevel::Critical);
        assert_eq!(request.request.resources, vec!["prod/billing".to_string()]);
        request.approve("carol")
    });

    let env = foreman.run(&task("t-5", "prod")).await;

    assert!(responder.await.unwrap());
    assert!(env.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(approval_decision(&env).unwrap().approver, "carol");
}

#[tokio::test]
async fn dropped_channel_fails_closed() {
    let (worker, calls) = deploy_worker();
    let (approver, pending) = ChannelApprover::new(1);
    drop(pending);
    let foreman = foreman(Arc::new(approver), worker).unwrap();

    let env = foreman.run(&task("t-6", "prod")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(env.error_kind, Some(ErrorKind::ApprovalRejected));
}

#[tokio::test(start_paused = true)]
async fn configured_approval_timeout_applies_under_standard_policy() {
    let (worker, calls) = deploy_worker();
    let approver = Arc::new(StaticApprover::approving("alice").with_delay(Duration::from_secs(2)));
    let foreman = Foreman::builder()
        .config(ForemanConfig::default().with_approval_timeout(Duration::from_secs(1)))
        .contract("release", Schema::new(), Schema::new())
        .unwrap()
        .contract("deploy", Schema::new(), Schema::new())
        .unwrap()
        .worker(worker)
        .unwrap()
        .approval_gated(
            "release",
            Step::new("deploy", json!({"service": "{input.service}"}), "deployment"),
            ActionDescriptor::new("deploy {input.service}", ["{input.env}/{input.service}"]),
            RiskPolicy::standard(),
            approver,
        )
        .unwrap()
        .build()
        .unwrap();

    let env = foreman.run(&task("t-7", "staging")).await;

    assert_eq!(env.error_kind, Some(ErrorKind::ApprovalTimeout), "unexpected: {env:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let audit = foreman.audit_log().records();
    assert_eq!(audit[0].request.risk_level, RiskLevel::High);
    assert_eq!(audit[0].request.timeout_seconds, 1);
}
