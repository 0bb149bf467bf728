use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use duraflow::activity::{Activity, Invocation, NodePath};
use duraflow::dispatcher::WorkerConfig;
use duraflow::event_bus::{Event, EventBus, MemorySink};
use duraflow::job::{JobId, JobRecord, JobStatus, NodeStatus, StopToken};
use duraflow::registry::{ActivityError, ActivityReturn, FnActivity};
use duraflow::runtime::{InMemoryJobStore, JobStore, OrchestratorConfig, Scheduler, StoreError};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Semaphore;

fn run_with(name: &str, arg: impl Into<serde_json::Value>) -> Activity {
    Activity::run(Invocation::new(name).with_arg(arg))
}

/// In-memory store with a toggleable outage and a write counter.
struct FaultStore {
    inner: InMemoryJobStore,
    broken: AtomicBool,
    saves: AtomicU32,
}

impl FaultStore {
    fn new() -> Self {
        Self {
            inner: InMemoryJobStore::new(),
            broken: AtomicBool::new(false),
            saves: AtomicU32::new(0),
        }
    }

    fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    fn save_count(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(StoreError::Backend("store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl JobStore for FaultStore {
    async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.check()?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(record).await
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord, StoreError> {
        self.check()?;
        self.inner.load(job_id).await
    }

    async fn list_due(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.check()?;
        self.inner.list_due().await
    }

    async fn delete(&self, job_id: JobId) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(job_id).await
    }
}

async fn wait_terminal(scheduler: &Scheduler, job_id: JobId) -> JobStatus {
    for _ in 0..400 {
        if let Ok(Some(status)) = scheduler.job_status(job_id).await {
            if status.is_terminal() {
                return status;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not reach a terminal status in time");
}

fn status_changes(sink: &MemorySink) -> Vec<(String, String)> {
    sink.snapshot()
        .into_iter()
        .filter_map(|event| match event {
            Event::JobStatusChanged { node, status, .. } => Some((node, status)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn sequential_job_emits_ordered_terminal_events() {
    let sink = MemorySink::new();
    let calls: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_calls = Arc::clone(&calls);

    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .with_event_bus(EventBus::with_sink(sink.clone()))
        .activity(
            "greet",
            FnActivity::new(move |args: Vec<serde_json::Value>| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.lock().push(args.first().cloned().unwrap_or(json!(null)));
                    Ok(ActivityReturn::Value(json!("greeted")))
                }
            }),
        )
        .start(Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();

    let graph = run_with("greet", "alice").then(run_with("greet", "cooper"));
    let job_id = scheduler.schedule(graph).await.unwrap();

    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    assert_eq!(*calls.lock(), vec![json!("alice"), json!("cooper")]);

    scheduler.shutdown().await;

    assert_eq!(
        status_changes(&sink),
        vec![
            ("$.0".to_string(), "succeeded".to_string()),
            ("$.1".to_string(), "succeeded".to_string()),
        ]
    );
    assert!(sink.snapshot().iter().any(|event| matches!(
        event,
        Event::JobCompleted {
            status: JobStatus::Succeeded,
            ..
        }
    )));
}

#[tokio::test]
async fn exhausted_failure_is_recovered_by_the_failed_combinator() {
    let sink = MemorySink::new();
    let flaky_runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&flaky_runs);

    let scheduler = OrchestratorConfig::new()
        .set_default_retry_count(1)
        .set_default_retry_delay(Duration::ZERO)
        .set_retry_timer_interval(Duration::from_millis(25))
        .with_event_bus(EventBus::with_sink(sink.clone()))
        .activity(
            "flaky",
            FnActivity::new(move |_args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<ActivityReturn, _>(ActivityError::raised("boom"))
                }
            }),
        )
        .activity(
            "recover",
            FnActivity::new(|_args| async { Ok(ActivityReturn::Value(json!("recovered"))) }),
        )
        .start(Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();

    let graph = Activity::run(Invocation::new("flaky")).failed(Activity::run(Invocation::new(
        "recover",
    )));
    let job_id = scheduler.schedule(graph).await.unwrap();

    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    // Initial run plus one retry before the failure became terminal.
    assert_eq!(flaky_runs.load(Ordering::SeqCst), 2);

    scheduler.shutdown().await;

    assert_eq!(
        status_changes(&sink),
        vec![
            ("$.0".to_string(), "failed".to_string()),
            ("$.1".to_string(), "succeeded".to_string()),
        ]
    );
}

#[tokio::test]
async fn stop_runs_compensation_and_then_continue_rejoins() {
    let compensated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&compensated);

    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .activity(
            "blocker",
            FnActivity::new(|_args| async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(ActivityReturn::done())
            }),
        )
        .activity(
            "compensate",
            FnActivity::new(move |_args| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(ActivityReturn::done())
                }
            }),
        )
        .start(Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();

    let token = StopToken::random();
    let graph = Activity::run(Invocation::new("blocker"))
        .cancelled(Activity::run(Invocation::new("compensate")))
        .then_continue();
    let job_id = scheduler.schedule_with_token(graph, token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(scheduler.stop(token).await.unwrap(), 1);
    // Recovered cancellation reads as success through the rejoin marker.
    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    assert!(compensated.load(Ordering::SeqCst));
    // The blocker is still sleeping on a worker; dropping the handle leaves
    // the pool to be torn down with the runtime.
}

#[tokio::test]
async fn dynamic_expansion_splices_and_runs_generated_steps() {
    let store = Arc::new(InMemoryJobStore::new());
    let calls: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let step_calls = Arc::clone(&calls);
    let finish_calls = Arc::clone(&calls);

    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .activity(
            "plan",
            FnActivity::new(|_args| async {
                Ok(ActivityReturn::Expand(Activity::sequence([
                    run_with("step", "a"),
                    run_with("step", "b"),
                ])))
            }),
        )
        .activity(
            "step",
            FnActivity::new(move |args: Vec<serde_json::Value>| {
                let calls = Arc::clone(&step_calls);
                async move {
                    calls.lock().push(args.first().cloned().unwrap_or(json!(null)));
                    Ok(ActivityReturn::done())
                }
            }),
        )
        .activity(
            "finish",
            FnActivity::new(move |_args| {
                let calls = Arc::clone(&finish_calls);
                async move {
                    calls.lock().push(json!("finish"));
                    Ok(ActivityReturn::done())
                }
            }),
        )
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    let graph = Activity::run(Invocation::new("plan")).then(Activity::run(Invocation::new(
        "finish",
    )));
    let job_id = scheduler.schedule(graph).await.unwrap();

    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    // The generated steps ran in order, and only then the successor.
    assert_eq!(*calls.lock(), vec![json!("a"), json!("b"), json!("finish")]);

    // The spliced fragment is part of the durable snapshot.
    let record = store.load(job_id).await.unwrap();
    let planner = NodePath::root().child(0);
    assert_eq!(record.node_status(&planner), NodeStatus::Expanded);
    let fragment = planner.child(0);
    assert_eq!(record.node_status(&fragment.child(0)), NodeStatus::Succeeded);
    assert_eq!(record.node_status(&fragment.child(1)), NodeStatus::Succeeded);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn admission_pushback_suspends_and_eventually_drains() {
    let sink = MemorySink::new();
    let gate = Arc::new(Semaphore::new(0));
    let handler_gate = Arc::clone(&gate);

    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .with_event_bus(EventBus::with_sink(sink.clone()))
        .activity_with(
            "gated",
            FnActivity::new(move |_args| {
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.acquire().await.unwrap().forget();
                    Ok(ActivityReturn::done())
                }
            }),
            WorkerConfig::new(1, 1),
        )
        .start(Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();

    let graph = Activity::parallel((0..4).map(|i| run_with("gated", i)));
    let job_id = scheduler.schedule(graph).await.unwrap();

    gate.add_permits(4);
    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);

    scheduler.shutdown().await;

    // With capacity for one queued and one running leaf, at least one of the
    // four parallel leaves was pushed back before eventually draining.
    assert!(sink
        .snapshot()
        .iter()
        .any(|event| matches!(event, Event::JobSuspended { .. })));
}

#[tokio::test]
async fn restart_resumes_from_the_last_recorded_node() {
    let store = Arc::new(InMemoryJobStore::new());

    // Seed a record captured mid-execution: the first leaf completed, the
    // second was in flight when the process died.
    let mut record = JobRecord::new(
        run_with("greet", "alice").then(run_with("greet", "cooper")),
        None,
    );
    let job_id = record.job_id;
    record.collect_ready();
    let first = NodePath::root().child(0);
    record.mark_running(&first);
    record.apply_success(&first, json!("greeted"));
    record.collect_ready();
    record.mark_running(&NodePath::root().child(1));
    store.save(&record).await.unwrap();

    let calls: Arc<Mutex<Vec<serde_json::Value>>> = Arc::new(Mutex::new(Vec::new()));
    let handler_calls = Arc::clone(&calls);
    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .activity(
            "greet",
            FnActivity::new(move |args: Vec<serde_json::Value>| {
                let calls = Arc::clone(&handler_calls);
                async move {
                    calls.lock().push(args.first().cloned().unwrap_or(json!(null)));
                    Ok(ActivityReturn::Value(json!("greeted")))
                }
            }),
        )
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    // Only the interrupted leaf re-ran; the completed one kept its result.
    assert_eq!(*calls.lock(), vec![json!("cooper")]);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn scheduling_an_unregistered_activity_fails_fast() {
    let scheduler = OrchestratorConfig::new()
        .activity(
            "known",
            FnActivity::new(|_args| async { Ok(ActivityReturn::done()) }),
        )
        .start(Arc::new(InMemoryJobStore::new()))
        .await
        .unwrap();

    let graph = run_with("known", 1).then(run_with("mystery", 2));
    let err = scheduler.schedule(graph).await.unwrap_err();
    assert!(err.to_string().contains("mystery"));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn cleanup_removes_the_stored_record() {
    let store = Arc::new(InMemoryJobStore::new());
    let scheduler = OrchestratorConfig::new()
        .activity(
            "noop",
            FnActivity::new(|_args| async { Ok(ActivityReturn::done()) }),
        )
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    let job_id = scheduler
        .schedule(Activity::run(Invocation::new("noop")))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);

    scheduler.cleanup(job_id).await.unwrap();
    assert_eq!(scheduler.job_status(job_id).await.unwrap(), None);
    assert!(store.is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn stop_is_not_acknowledged_past_a_store_outage() {
    let store = Arc::new(FaultStore::new());
    let compensated = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&compensated);

    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .activity(
            "blocker",
            FnActivity::new(|_args| async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(ActivityReturn::done())
            }),
        )
        .activity(
            "compensate",
            FnActivity::new(move |_args| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(ActivityReturn::done())
                }
            }),
        )
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    let token = StopToken::random();
    let graph = Activity::run(Invocation::new("blocker"))
        .cancelled(Activity::run(Invocation::new("compensate")))
        .then_continue();
    let job_id = scheduler.schedule_with_token(graph, token).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    store.set_broken(true);
    assert!(scheduler.stop(token).await.is_err());
    // The signal was never durably recorded: the job keeps running and no
    // compensation fires.
    assert_eq!(
        scheduler.job_status(job_id).await.unwrap(),
        Some(JobStatus::Running)
    );
    assert!(!compensated.load(Ordering::SeqCst));

    store.set_broken(false);
    assert_eq!(scheduler.stop(token).await.unwrap(), 1);
    assert_eq!(wait_terminal(&scheduler, job_id).await, JobStatus::Succeeded);
    assert!(compensated.load(Ordering::SeqCst));
    // The blocker is still sleeping on a worker; dropping the handle leaves
    // the pool to be torn down with the runtime.
}

#[tokio::test]
async fn job_status_distinguishes_store_outage_from_absence() {
    let store = Arc::new(FaultStore::new());
    let scheduler = OrchestratorConfig::new()
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    assert_eq!(scheduler.job_status(JobId::random()).await.unwrap(), None);

    store.set_broken(true);
    assert!(scheduler.job_status(JobId::random()).await.is_err());

    store.set_broken(false);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn quiet_retry_ticks_do_not_rewrite_the_snapshot() {
    let store = Arc::new(FaultStore::new());
    let scheduler = OrchestratorConfig::new()
        .set_retry_timer_interval(Duration::from_millis(25))
        .activity(
            "blocker",
            FnActivity::new(|_args| async {
                tokio::time::sleep(Duration::from_secs(300)).await;
                Ok(ActivityReturn::done())
            }),
        )
        .start(Arc::clone(&store) as Arc<dyn JobStore>)
        .await
        .unwrap();

    let job_id = scheduler
        .schedule(Activity::run(Invocation::new("blocker")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let settled = store.save_count();
    tokio::time::sleep(Duration::from_millis(300)).await;
    // A dozen ticks passed with nothing to dispatch; the stored record was
    // not rewritten.
    assert_eq!(store.save_count(), settled);
    assert_eq!(
        scheduler.job_status(job_id).await.unwrap(),
        Some(JobStatus::Running)
    );
    // The blocker never returns; the handle is dropped with the runtime.
}
