use std::sync::Arc;
use std::time::Duration;

use duraflow::activity::{Invocation, NodePath};
use duraflow::dispatcher::{
    CompletionReport, DispatchError, Dispatcher, WorkItem, WorkOutcome, WorkerConfig,
};
use duraflow::job::JobId;
use duraflow::registry::{ActivityError, ActivityRegistry, ActivityReturn, FnActivity};
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::Semaphore;

fn item(job_id: JobId, index: u32, activity: &str) -> WorkItem {
    WorkItem {
        job_id,
        path: NodePath::root().child(index),
        invocation: Invocation::new(activity).with_arg(index),
    }
}

fn gated_registry(gate: Arc<Semaphore>) -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    registry.insert(
        "gated",
        Arc::new(FnActivity::new(move |_args| {
            let gate = Arc::clone(&gate);
            async move {
                gate.acquire().await.unwrap().forget();
                Ok(ActivityReturn::Value(json!("done")))
            }
        })),
    );
    registry
}

#[tokio::test]
async fn full_queue_rejects_admission_and_drains_after_release() {
    let gate = Arc::new(Semaphore::new(0));
    let registry = gated_registry(Arc::clone(&gate));
    let mut configs = FxHashMap::default();
    configs.insert("gated".to_string(), WorkerConfig::new(1, 1));
    let (completion_tx, completion_rx) = flume::unbounded::<CompletionReport>();
    let dispatcher = Dispatcher::new(
        &registry,
        &configs,
        WorkerConfig::default(),
        completion_tx,
    );

    let job_id = JobId::random();
    dispatcher.submit(item(job_id, 0, "gated")).unwrap();
    // Give the single worker time to take the first item off the queue.
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.submit(item(job_id, 1, "gated")).unwrap();

    let err = dispatcher.submit(item(job_id, 2, "gated")).unwrap_err();
    match err {
        DispatchError::AdmissionRejected { activity, capacity } => {
            assert_eq!(activity, "gated");
            assert_eq!(capacity, 1);
        }
        other => panic!("expected admission rejection, got {other:?}"),
    }

    gate.add_permits(2);
    for _ in 0..2 {
        let report = completion_rx.recv_async().await.unwrap();
        assert_eq!(report.job_id, job_id);
        assert!(matches!(report.outcome, WorkOutcome::Completed(_)));
    }

    // Capacity freed up; the rejected item is admissible on resubmission.
    dispatcher.submit(item(job_id, 2, "gated")).unwrap();
    gate.add_permits(1);
    let report = completion_rx.recv_async().await.unwrap();
    assert_eq!(report.path, NodePath::root().child(2));

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn unknown_activity_is_rejected_at_submission() {
    let registry = ActivityRegistry::new();
    let (completion_tx, _completion_rx) = flume::unbounded::<CompletionReport>();
    let dispatcher = Dispatcher::new(
        &registry,
        &FxHashMap::default(),
        WorkerConfig::default(),
        completion_tx,
    );

    let err = dispatcher
        .submit(item(JobId::random(), 0, "nonexistent"))
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownActivity { .. }));
}

#[tokio::test]
async fn handler_errors_surface_as_failed_outcomes() {
    let mut registry = ActivityRegistry::new();
    registry.insert(
        "explode",
        Arc::new(FnActivity::new(|_args| async {
            Err::<ActivityReturn, _>(ActivityError::raised("boom"))
        })),
    );
    let (completion_tx, completion_rx) = flume::unbounded::<CompletionReport>();
    let dispatcher = Dispatcher::new(
        &registry,
        &FxHashMap::default(),
        WorkerConfig::default(),
        completion_tx,
    );

    let job_id = JobId::random();
    dispatcher.submit(item(job_id, 0, "explode")).unwrap();
    let report = completion_rx.recv_async().await.unwrap();
    match report.outcome {
        WorkOutcome::Failed(detail) => {
            assert_eq!(detail.activity, "explode");
            assert!(detail.message.contains("boom"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn expansion_returns_surface_as_expanded_outcomes() {
    use duraflow::activity::Activity;

    let mut registry = ActivityRegistry::new();
    registry.insert(
        "planner",
        Arc::new(FnActivity::new(|_args| async {
            Ok(ActivityReturn::Expand(Activity::run(Invocation::new(
                "step",
            ))))
        })),
    );
    let (completion_tx, completion_rx) = flume::unbounded::<CompletionReport>();
    let dispatcher = Dispatcher::new(
        &registry,
        &FxHashMap::default(),
        WorkerConfig::default(),
        completion_tx,
    );

    dispatcher.submit(item(JobId::random(), 0, "planner")).unwrap();
    let report = completion_rx.recv_async().await.unwrap();
    assert!(matches!(report.outcome, WorkOutcome::Expanded(_)));

    dispatcher.shutdown().await;
}
