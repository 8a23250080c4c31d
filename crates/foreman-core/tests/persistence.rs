//! On-disk attempt store and audit log across foreman instances.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use foreman_core::{
    read_audit_log, write_audit_log, ActionDescriptor, AttemptStore, CompletionPromise,
    FieldShape, Foreman, ForemanResult, FnWorker, FsAttemptStore, ResultEnvelope, RiskPolicy,
    Schema, StaticApprover, Step, TaskEnvelope, Worker,
};

fn worker(skill_id: &'static str, calls: Arc<AtomicUsize>, fail_first: bool) -> Arc<dyn Worker> {
    Arc::new(FnWorker::new(skill_id, move |_task: TaskEnvelope| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if fail_first && call == 0 {
                Ok(ResultEnvelope::error("disk full", CompletionPromise::InProgress))
            } else {
                Ok(ResultEnvelope::success(json!({"text": skill_id})))
            }
        }
    }))
}

fn foreman(
    store: FsAttemptStore,
    fetch: Arc<AtomicUsize>,
    render: Arc<AtomicUsize>,
    fail_render: bool,
) -> ForemanResult<Foreman> {
    let text = || Schema::new().required("text", FieldShape::String);
    Foreman::builder()
        .contract("report", Schema::new(), text())?
        .contract("fetch", Schema::new(), text())?
        .contract("render", text(), text())?
        .worker(worker("fetch", fetch, false))?
        .worker(worker("render", render, fail_render))?
        .sequential(
            "report",
            vec![
                Step::new("fetch", json!({"q": "{input.q}"}), "raw"),
                Step::new("render", json!({"text": "{raw.text}"}), "page"),
            ],
        )?
        .attempt_store(Arc::new(store))
        .build()
}

#[tokio::test]
async fn restarted_foreman_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let task = TaskEnvelope::new("nightly/2024-06-01", "report", json!({"q": "sales"}));

    let counter = || Arc::new(AtomicUsize::new(0));
    let first = foreman(FsAttemptStore::new(dir.path()).unwrap(), counter(), counter(), true)
        .unwrap()
        .run(&task)
        .await;
    assert_eq!(first.reason.as_deref(), Some("disk full"));

    // A new process: fresh foreman, fresh workers, same state directory.
    let fetch_again = Arc::new(AtomicUsize::new(0));
    let render_again = Arc::new(AtomicUsize::new(0));
    let store = FsAttemptStore::new(dir.path()).unwrap();
    let second = foreman(store.clone(), fetch_again.clone(), render_again.clone(), false)
        .unwrap()
        .run(&task)
        .await;

    assert!(second.is_complete(), "unexpected: {second:?}");
    assert_eq!(fetch_again.load(Ordering::SeqCst), 0);
    assert_eq!(render_again.load(Ordering::SeqCst), 1);
    assert_eq!(store.load("nightly/2024-06-01").await.unwrap(), Some(second));
}

#[tokio::test]
async fn audit_log_survives_a_round_trip_to_disk() {
    let calls = Arc::new(AtomicUsize::new(0));
    let foreman = Foreman::builder()
        .contract("wipe", Schema::new(), Schema::new())
        .unwrap()
        .contract("cache.clear", Schema::new(), Schema::new())
        .unwrap()
        .worker(worker("cache.clear", calls.clone(), false))
        .unwrap()
        .approval_gated(
            "wipe",
            Step::new("cache.clear", json!({"name": "{input.name}"}), "cleared"),
            ActionDescriptor::new("delete cache {input.name}", ["cache/{input.name}"]),
            RiskPolicy::standard(),
            Arc::new(StaticApprover::approving("ops-oncall")),
        )
        .unwrap()
        .build()
        .unwrap();

    let env = foreman
        .run(&TaskEnvelope::new("t-1", "wipe", json!({"name": "sessions"})))
        .await;
    assert!(env.is_complete());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.json");
    write_audit_log(&foreman.audit_log().records(), &path).unwrap();
    let records = read_audit_log(&path).unwrap();

    assert_eq!(records, foreman.audit_log().records());
    assert_eq!(records[0].decision.approver, "ops-oncall");
    assert!(records.iter().all(|r| r.verify_integrity()));
}
