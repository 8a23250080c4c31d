//! Resuming a task from its previous attempt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;

use foreman_core::{
    AttemptStore, CompletionPromise, FieldShape, Foreman, ForemanBuilder, ForemanResult, FnWorker,
    MemoryAttemptStore, ResultEnvelope, Schema, Step, TaskEnvelope, Worker,
};

/// Fails its first `failures` calls, then succeeds with `{"text": <skill>}`.
fn flaky(skill_id: &'static str, failures: usize) -> (Arc<dyn Worker>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let worker = FnWorker::new(skill_id, move |_task: TaskEnvelope| {
        let call = seen.fetch_add(1, Ordering::SeqCst);
        async move {
            if call < failures {
                Ok(ResultEnvelope::error("rate limited", CompletionPromise::InProgress))
            } else {
                Ok(ResultEnvelope::success(json!({"text": skill_id})))
            }
        }
    });
    (Arc::new(worker), calls)
}

fn text() -> Schema {
    Schema::new().required("text", FieldShape::String)
}

fn contracts(builder: ForemanBuilder, skills: &[&str]) -> ForemanResult<ForemanBuilder> {
    skills
        .iter()
        .try_fold(builder, |b, skill| b.contract(*skill, Schema::new(), text()))
}

struct Pipeline {
    foreman: Foreman,
    calls: Vec<Arc<AtomicUsize>>,
}

/// `one -> two -> three`, where `three` fails once.
fn pipeline(store: Option<Arc<dyn AttemptStore>>) -> ForemanResult<Pipeline> {
    let (w1, c1) = flaky("one", 0);
    let (w2, c2) = flaky("two", 0);
    let (w3, c3) = flaky("three", 1);
    let mut builder = contracts(Foreman::builder(), &["pipeline", "one", "two", "three"])?
        .worker(w1)?
        .worker(w2)?
        .worker(w3)?
        .sequential(
            "pipeline",
            vec![
                Step::new("one", json!({"seed": "{input.seed}"}), "first"),
                Step::new("two", json!({"text": "{first.text}"}), "second"),
                Step::new("three", json!({"text": "{second.text}"}), "third"),
            ],
        )?;
    if let Some(store) = store {
        builder = builder.attempt_store(store);
    }
    Ok(Pipeline {
        foreman: builder.build()?,
        calls: vec![c1, c2, c3],
    })
}

fn counts(calls: &[Arc<AtomicUsize>]) -> Vec<usize> {
    calls.iter().map(|c| c.load(Ordering::SeqCst)).collect()
}

fn task(id: &str) -> TaskEnvelope {
    TaskEnvelope::new(id, "pipeline", json!({"seed": 7}))
}

#[tokio::test]
async fn completed_steps_are_not_invoked_again() {
    let p = pipeline(None).unwrap();

    let first = p.foreman.run(&task("t-1")).await;
    assert_eq!(first.completion_promise, CompletionPromise::InProgress);
    assert_eq!(first.reason.as_deref(), Some("rate limited"));
    assert_eq!(counts(&p.calls), vec![1, 1, 1]);

    let second = p
        .foreman
        .run(&task("t-1").with_previous_attempt(first))
        .await;

    assert!(second.is_complete(), "unexpected: {second:?}");
    assert_eq!(counts(&p.calls), vec![1, 1, 2], "only step three runs again");
    assert_eq!(second.result, Some(json!({"text": "three"})));
    assert_eq!(second.steps.len(), 3);
    assert!(second.steps.iter().all(|s| s.is_complete()));
}

#[tokio::test]
async fn previous_attempt_of_another_task_is_ignored() {
    let p = pipeline(None).unwrap();
    let first = p.foreman.run(&task("t-1")).await;

    let env = p
        .foreman
        .run(&task("t-2").with_previous_attempt(first))
        .await;

    assert!(env.is_complete());
    assert_eq!(counts(&p.calls), vec![2, 2, 2]);
    assert_eq!(env.task_id.as_deref(), Some("t-2"));
}

#[tokio::test]
async fn attempt_store_supplies_the_previous_attempt() {
    let store = Arc::new(MemoryAttemptStore::new());
    let p = pipeline(Some(store.clone())).unwrap();

    let first = p.foreman.run(&task("t-1")).await;
    assert!(!first.is_success());
    assert_eq!(store.load("t-1").await.unwrap(), Some(first));

    let second = p.foreman.run(&task("t-1")).await;
    assert!(second.is_complete());
    assert_eq!(counts(&p.calls), vec![1, 1, 2]);
    assert_eq!(store.load("t-1").await.unwrap(), Some(second));
}

#[tokio::test]
async fn resumed_fan_out_reruns_only_failed_branches_and_aggregator() {
    let (wa, ca) = flaky("alpha", 0);
    let (wb, cb) = flaky("beta", 1);
    let (wm, cm) = flaky("merge", 0);
    let foreman = contracts(Foreman::builder(), &["survey", "alpha", "beta", "merge"])
        .unwrap()
        .worker(wa)
        .unwrap()
        .worker(wb)
        .unwrap()
        .worker(wm)
        .unwrap()
        .parallel(
            "survey",
            vec![
                Step::new("alpha", json!({"seed": "{input.seed}"}), "a"),
                Step::new("beta", json!({"seed": "{input.seed}"}), "b"),
            ],
            Step::new("merge", json!({"a": "{a}", "b": "{b}"}), "merged"),
        )
        .unwrap()
        .build()
        .unwrap();
    let survey = TaskEnvelope::new("t-9", "survey", json!({"seed": 1}));

    let first = foreman.run(&survey).await;
    assert_eq!(first.completion_promise, CompletionPromise::Blocked);

    let second = foreman.run(&survey.clone().with_previous_attempt(first)).await;

    assert!(second.is_complete(), "unexpected: {second:?}");
    assert_eq!(ca.load(Ordering::SeqCst), 1);
    assert_eq!(cb.load(Ordering::SeqCst), 2);
    assert_eq!(cm.load(Ordering::SeqCst), 2, "aggregator always runs again");
}

#[tokio::test]
async fn resumed_result_violating_contract_is_run_again() {
    let p = pipeline(None).unwrap();
    let mut first = p.foreman.run(&task("t-1")).await;
    let stale = first
        .steps
        .iter_mut()
        .find(|s| s.output_key == "first")
        .unwrap();
    stale.result = Some(json!({"bogus": 1}));

    let second = p
        .foreman
        .run(&task("t-1").with_previous_attempt(first))
        .await;

    assert!(second.is_complete(), "unexpected: {second:?}");
    assert_eq!(counts(&p.calls), vec![2, 1, 2], "step one runs again, step two is reused");
    assert_eq!(second.steps[0].result, Some(json!({"text": "one"})));
}
