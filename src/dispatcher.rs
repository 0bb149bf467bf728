//! Bounded worker pools with per-activity-type admission control.
//!
//! The dispatcher owns one bounded queue and a fixed-size worker pool per
//! registered activity type. Submission never blocks: a full queue yields an
//! admission-rejected error and the scheduler retries the node later. Workers
//! invoke the registered handler and report the outcome on the scheduler's
//! completion channel; they never touch job state themselves, which keeps the
//! scheduler the single writer.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::activity::{Activity, Invocation, NodePath};
use crate::atom::Atom;
use crate::job::{ErrorDetail, JobId};
use crate::registry::{ActivityRegistry, ActivityReturn};

/// Queue and pool sizing for one activity type. Immutable after the
/// scheduler is built.
#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    pub max_queue_length: usize,
    pub max_workers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_queue_length: 16,
            max_workers: 4,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn new(max_queue_length: usize, max_workers: usize) -> Self {
        Self {
            max_queue_length: max_queue_length.max(1),
            max_workers: max_workers.max(1),
        }
    }
}

/// One ready node handed to a worker pool.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub job_id: JobId,
    pub path: NodePath,
    pub invocation: Invocation,
}

/// What a worker observed for one work item.
#[derive(Clone, Debug)]
pub enum WorkOutcome {
    /// The invocation returned a final value.
    Completed(Value),
    /// The invocation returned a new graph fragment to splice in.
    Expanded(Activity),
    /// The invocation raised.
    Failed(ErrorDetail),
}

/// Outcome report sent back to the scheduler's single-writer loop.
#[derive(Clone, Debug)]
pub struct CompletionReport {
    pub job_id: JobId,
    pub path: NodePath,
    pub outcome: WorkOutcome,
}

#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    /// The activity type's queue is at capacity. The caller must back off
    /// and retry admission later; the node is never dropped.
    #[error("admission rejected for activity {activity}: queue at capacity {capacity}")]
    #[diagnostic(
        code(duraflow::dispatcher::admission_rejected),
        help("Raise max_queue_length for this activity or reduce concurrent ready nodes.")
    )]
    AdmissionRejected { activity: String, capacity: usize },

    /// No handler registered under the invocation's activity-type name.
    #[error("unknown activity type: {activity}")]
    #[diagnostic(
        code(duraflow::dispatcher::unknown_activity),
        help("Register the activity on the configuration before scheduling graphs that use it.")
    )]
    UnknownActivity { activity: String },

    /// The pool's workers have shut down.
    #[error("worker pool for {activity} is closed")]
    #[diagnostic(code(duraflow::dispatcher::pool_closed))]
    PoolClosed { activity: String },
}

struct WorkerPool {
    queue_tx: flume::Sender<WorkItem>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
}

/// Routes work items to per-activity worker pools.
pub struct Dispatcher {
    pools: FxHashMap<String, WorkerPool>,
}

impl Dispatcher {
    /// Build one pool per registered activity, wired to report completions on
    /// `completion_tx`.
    pub fn new(
        registry: &ActivityRegistry,
        configs: &FxHashMap<String, WorkerConfig>,
        default_config: WorkerConfig,
        completion_tx: flume::Sender<CompletionReport>,
    ) -> Self {
        let mut pools = FxHashMap::default();
        for (name, handler) in registry.iter() {
            let config = configs.get(name).copied().unwrap_or(default_config);
            pools.insert(
                name.to_string(),
                WorkerPool::spawn(name, Arc::clone(handler), config, completion_tx.clone()),
            );
        }
        Self { pools }
    }

    /// Enqueue one ready node. Fails fast with
    /// [`DispatchError::AdmissionRejected`] when the queue is full.
    #[instrument(skip(self, item), fields(job = %item.job_id, node = %item.path, activity = %item.invocation.activity))]
    pub fn submit(&self, item: WorkItem) -> Result<(), DispatchError> {
        let activity = item.invocation.activity.clone();
        let Some(pool) = self.pools.get(&activity) else {
            return Err(DispatchError::UnknownActivity { activity });
        };
        match pool.queue_tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(DispatchError::AdmissionRejected {
                activity,
                capacity: pool.capacity,
            }),
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(DispatchError::PoolClosed { activity })
            }
        }
    }

    /// Close all queues and wait for in-flight work to drain.
    pub async fn shutdown(self) {
        for (_, pool) in self.pools {
            drop(pool.queue_tx);
            for worker in pool.workers {
                let _ = worker.await;
            }
        }
    }
}

impl WorkerPool {
    fn spawn(
        activity: &str,
        handler: Arc<dyn crate::registry::ActivityHandler>,
        config: WorkerConfig,
        completion_tx: flume::Sender<CompletionReport>,
    ) -> Self {
        let (queue_tx, queue_rx) = flume::bounded::<WorkItem>(config.max_queue_length);
        let mut workers = Vec::with_capacity(config.max_workers);
        for worker_index in 0..config.max_workers {
            let queue_rx = queue_rx.clone();
            let completion_tx = completion_tx.clone();
            let handler = Arc::clone(&handler);
            let activity = activity.to_string();
            workers.push(tokio::spawn(async move {
                while let Ok(item) = queue_rx.recv_async().await {
                    debug!(
                        activity = %activity,
                        worker = worker_index,
                        job = %item.job_id,
                        node = %item.path,
                        "worker picked up node"
                    );
                    let outcome = Self::execute(&handler, &item).await;
                    let report = CompletionReport {
                        job_id: item.job_id,
                        path: item.path,
                        outcome,
                    };
                    if completion_tx.send_async(report).await.is_err() {
                        // Scheduler loop is gone; stop consuming.
                        break;
                    }
                }
            }));
        }
        Self {
            queue_tx,
            capacity: config.max_queue_length,
            workers,
        }
    }

    /// Charge the invocation as an atom so synchronous and asynchronous
    /// handlers execute uniformly and suspension never blocks the pool's
    /// other workers.
    async fn execute(
        handler: &Arc<dyn crate::registry::ActivityHandler>,
        item: &WorkItem,
    ) -> WorkOutcome {
        let handler = Arc::clone(handler);
        let args = item.invocation.args.clone();
        let atom = Atom::of(move || {
            let handler = Arc::clone(&handler);
            let args = args.clone();
            async move {
                handler
                    .invoke(&args)
                    .await
                    .map_err(|e| crate::atom::AtomError::raised(e.to_string()))
            }
        });
        match atom.charge().await {
            Ok(ActivityReturn::Value(value)) => WorkOutcome::Completed(value),
            Ok(ActivityReturn::Expand(fragment)) => WorkOutcome::Expanded(fragment),
            Err(err) => {
                WorkOutcome::Failed(ErrorDetail::new(
                    item.invocation.activity.as_str(),
                    err.to_string(),
                ))
            }
        }
    }
}
