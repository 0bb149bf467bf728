//! The single-writer scheduler loop and its public handle.
//!
//! All mutation of job records happens inside one spawned task that selects
//! over three inputs: API commands, worker completion reports, and the retry
//! timer. Workers never touch job state; they report outcomes on a channel
//! and the loop applies them. Every applied outcome is persisted before the
//! in-memory record is committed, so an acknowledged transition is always
//! recoverable.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::activity::{Activity, NodePath};
use crate::dispatcher::{
    CompletionReport, DispatchError, Dispatcher, WorkItem, WorkOutcome,
};
use crate::event_bus::{Event, EventBus};
use crate::job::{
    ErrorDetail, FailureDisposition, JobId, JobRecord, JobStatus, NodeStatus, RetryPolicy,
    StopToken,
};
use crate::registry::ActivityRegistry;

use super::config::OrchestratorConfig;
use super::store::{JobStore, StoreError};

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    #[diagnostic(code(duraflow::scheduler::closed))]
    Closed,

    #[error("activity types not registered: {}", .0.join(", "))]
    #[diagnostic(
        code(duraflow::scheduler::unknown_activities),
        help("Register every activity the graph invokes before starting the scheduler.")
    )]
    UnknownActivities(Vec<String>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

enum Command {
    Schedule {
        activity: Activity,
        stop_token: Option<StopToken>,
        reply: oneshot::Sender<Result<JobId, SchedulerError>>,
    },
    Stop {
        token: StopToken,
        reply: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    JobStatus {
        job_id: JobId,
        reply: oneshot::Sender<Result<Option<JobStatus>, SchedulerError>>,
    },
    Cleanup {
        job_id: JobId,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running scheduler. Cheap to share behind an `Arc`; every
/// method forwards a command to the loop task and awaits its reply.
pub struct Scheduler {
    cmd_tx: flume::Sender<Command>,
    loop_handle: JoinHandle<()>,
    event_bus: Arc<EventBus>,
}

impl Scheduler {
    /// Recover non-terminal jobs from the store, spawn the worker pools and
    /// the loop task, and return the handle.
    pub(crate) async fn start(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, SchedulerError> {
        let recovered = store.list_due().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "resuming interrupted jobs");
        }

        let event_bus = Arc::new(config.event_bus);
        event_bus.listen_for_events();
        let event_tx = event_bus.get_sender();

        let (completion_tx, completion_rx) = flume::unbounded::<CompletionReport>();
        let dispatcher = Dispatcher::new(
            &config.registry,
            &config.worker_configs,
            config.default_worker,
            completion_tx.clone(),
        );

        let (cmd_tx, cmd_rx) = flume::unbounded::<Command>();
        let scheduler_loop = SchedulerLoop {
            jobs: FxHashMap::default(),
            store,
            registry: config.registry,
            dispatcher,
            retry_policy: config.retry_policy,
            retry_timer_interval: config.retry_timer_interval,
            event_tx,
            completion_tx,
            completion_rx,
            cmd_rx,
        };
        let loop_handle = tokio::spawn(scheduler_loop.run(recovered));

        Ok(Self {
            cmd_tx,
            loop_handle,
            event_bus,
        })
    }

    /// Schedule a graph without a stop token (it cannot be cancelled).
    pub async fn schedule(&self, activity: Activity) -> Result<JobId, SchedulerError> {
        self.schedule_inner(activity, None).await
    }

    /// Schedule a graph under a stop token shared by related jobs.
    pub async fn schedule_with_token(
        &self,
        activity: Activity,
        stop_token: StopToken,
    ) -> Result<JobId, SchedulerError> {
        self.schedule_inner(activity, Some(stop_token)).await
    }

    async fn schedule_inner(
        &self,
        activity: Activity,
        stop_token: Option<StopToken>,
    ) -> Result<JobId, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::Schedule {
                activity,
                stop_token,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Signal cancellation of every active job scheduled under `token`.
    /// Returns how many jobs durably recorded the signal; a store failure
    /// surfaces here and the un-persisted jobs keep running, so `stop` is
    /// safe to retry.
    pub async fn stop(&self, token: StopToken) -> Result<usize, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::Stop { token, reply })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Current status of a job, consulting the store for jobs no longer
    /// active in memory. `Ok(None)` means the job is unknown; a store
    /// outage is an error, not absence.
    pub async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::JobStatus { job_id, reply })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Remove a terminal job's record from the store.
    pub async fn cleanup(&self, job_id: JobId) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send_async(Command::Cleanup { job_id, reply })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Shut down: stop accepting commands, drain worker pools, and flush the
    /// event listener.
    pub async fn shutdown(self) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send_async(Command::Shutdown { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        let _ = self.loop_handle.await;
        self.event_bus.stop_listener().await;
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }
}

struct SchedulerLoop {
    jobs: FxHashMap<JobId, JobRecord>,
    store: Arc<dyn JobStore>,
    registry: ActivityRegistry,
    dispatcher: Dispatcher,
    retry_policy: RetryPolicy,
    retry_timer_interval: std::time::Duration,
    event_tx: flume::Sender<Event>,
    completion_tx: flume::Sender<CompletionReport>,
    completion_rx: flume::Receiver<CompletionReport>,
    cmd_rx: flume::Receiver<Command>,
}

impl SchedulerLoop {
    async fn run(mut self, recovered: Vec<JobRecord>) {
        for mut record in recovered {
            // Leaves caught mid-flight by a crash run again; completion was
            // never recorded, so re-invocation is the at-least-once path.
            for status in record.statuses.values_mut() {
                if matches!(status, NodeStatus::Running) {
                    *status = NodeStatus::Ready;
                }
            }
            let job_id = record.job_id;
            debug!(job = %job_id, "rehydrated job record");
            self.jobs.insert(job_id, record);
            self.pump(job_id).await;
        }

        let cmd_rx = self.cmd_rx.clone();
        let completion_rx = self.completion_rx.clone();
        let mut ticker = tokio::time::interval(self.retry_timer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv_async() => match cmd {
                    Ok(Command::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Ok(cmd) => self.handle_command(cmd).await,
                    Err(_) => break,
                },
                report = completion_rx.recv_async() => match report {
                    Ok(report) => self.apply_completion(report).await,
                    Err(_) => break,
                },
                _ = ticker.tick() => self.on_tick().await,
            }
        }

        self.dispatcher.shutdown().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Schedule {
                activity,
                stop_token,
                reply,
            } => {
                let _ = reply.send(self.schedule(activity, stop_token).await);
            }
            Command::Stop { token, reply } => {
                let _ = reply.send(self.stop(token).await);
            }
            Command::JobStatus { job_id, reply } => {
                let status = match self.jobs.get(&job_id) {
                    Some(record) => Ok(Some(record.job_status())),
                    None => match self.store.load(job_id).await {
                        Ok(record) => Ok(Some(record.job_status())),
                        Err(StoreError::NotFound(_)) => Ok(None),
                        Err(e) => Err(SchedulerError::from(e)),
                    },
                };
                let _ = reply.send(status);
            }
            Command::Cleanup { job_id, reply } => {
                self.jobs.remove(&job_id);
                let _ = reply.send(self.store.delete(job_id).await.map_err(Into::into));
            }
            Command::Shutdown { .. } => {}
        }
    }

    #[instrument(skip(self, activity), err)]
    async fn schedule(
        &mut self,
        activity: Activity,
        stop_token: Option<StopToken>,
    ) -> Result<JobId, SchedulerError> {
        let mut unknown = Vec::new();
        collect_unknown(&activity, &self.registry, &mut unknown);
        if !unknown.is_empty() {
            return Err(SchedulerError::UnknownActivities(unknown));
        }

        let record = JobRecord::new(activity, stop_token);
        let job_id = record.job_id;
        // Durable before acknowledged: a scheduled job survives a crash that
        // happens right after the caller gets its id.
        self.store.save(&record).await?;
        self.jobs.insert(job_id, record);
        let _ = self.event_tx.send(Event::JobCreated { job_id });
        self.pump(job_id).await;
        self.finalize_if_terminal(job_id).await;
        Ok(job_id)
    }

    async fn stop(&mut self, token: StopToken) -> Result<usize, SchedulerError> {
        let targets: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, record)| record.stop_token == Some(token))
            .map(|(id, _)| *id)
            .collect();
        let mut observed = 0;
        for job_id in &targets {
            let Some(record) = self.jobs.get(job_id) else {
                continue;
            };
            // Durable before acknowledged: the cancellation is applied to a
            // clone and committed only once the store accepted it, so a crash
            // never resumes a job whose stop was already reported.
            let mut updated = record.clone();
            let cancelled = updated.request_cancel();
            self.store.save(&updated).await?;
            self.jobs.insert(*job_id, updated);
            for path in cancelled {
                let _ = self.event_tx.send(Event::JobStatusChanged {
                    job_id: *job_id,
                    node: path.encode(),
                    status: NodeStatus::Cancelled.label().to_string(),
                    error: None,
                });
            }
            self.pump(*job_id).await;
            self.finalize_if_terminal(*job_id).await;
            observed += 1;
        }
        Ok(observed)
    }

    async fn on_tick(&mut self) {
        let now = chrono::Utc::now();
        let job_ids: Vec<JobId> = self.jobs.keys().copied().collect();
        for job_id in job_ids {
            if let Some(record) = self.jobs.get_mut(&job_id) {
                let revived = record.revive_due_retries(now);
                for path in &revived {
                    debug!(job = %job_id, node = %path, "retry due, node revived");
                }
            }
            self.pump(job_id).await;
            self.finalize_if_terminal(job_id).await;
        }
    }

    /// Promote and submit every ready leaf of one job. Admission rejections
    /// leave the leaf ready for the next tick; submission errors with no
    /// recovery path (an unknown activity in a spliced fragment) fail the
    /// leaf without retries, which may in turn unlock a recovery
    /// continuation, so the collect loop repeats until quiescent.
    async fn pump(&mut self, job_id: JobId) {
        let mut dirty = false;
        loop {
            let Some(record) = self.jobs.get_mut(&job_id) else {
                return;
            };
            let ready = record.collect_ready();
            let mut dead: Vec<(NodePath, String, String)> = Vec::new();
            for node in ready {
                let activity = node.invocation.activity.clone();
                let item = WorkItem {
                    job_id,
                    path: node.path.clone(),
                    invocation: node.invocation,
                };
                match self.dispatcher.submit(item) {
                    Ok(()) => {
                        record.mark_running(&node.path);
                        dirty = true;
                    }
                    Err(DispatchError::AdmissionRejected { activity, capacity }) => {
                        debug!(
                            job = %job_id,
                            node = %node.path,
                            activity = %activity,
                            "admission rejected, leaf stays ready"
                        );
                        let _ = self.event_tx.send(Event::JobSuspended {
                            job_id,
                            activity,
                            reason: format!("queue at capacity {capacity}"),
                        });
                    }
                    Err(err) => {
                        dead.push((node.path, activity, err.to_string()));
                    }
                }
            }
            if dead.is_empty() {
                break;
            }
            dirty = true;
            let no_retry = RetryPolicy {
                max_retries: 0,
                delay: self.retry_policy.delay,
            };
            for (path, activity, message) in dead {
                record.apply_failure(
                    &path,
                    ErrorDetail::new(activity.as_str(), message),
                    &no_retry,
                );
                let _ = self.event_tx.send(Event::JobStatusChanged {
                    job_id,
                    node: path.encode(),
                    status: "failed".to_string(),
                    error: Some(format!("undispatchable activity {activity}")),
                });
            }
        }

        // Quiet ticks leave the record untouched; only dispatch outcomes
        // warrant a snapshot. Ready promotions alone are re-derived on
        // replay, so skipping them loses nothing.
        if !dirty {
            return;
        }
        let snapshot = self.jobs.get(&job_id).cloned();
        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.save(&snapshot).await {
                // Ready/Running marks are safe to lose: a crash replays them.
                warn!(job = %job_id, error = %e, "failed to persist dispatch marks");
            }
        }
    }

    /// Apply one worker outcome. The updated record is persisted before it
    /// replaces the in-memory one; a store failure requeues the report so
    /// acknowledged progress never outruns the store.
    async fn apply_completion(&mut self, report: CompletionReport) {
        let Some(record) = self.jobs.get(&report.job_id) else {
            debug!(job = %report.job_id, "completion for inactive job discarded");
            return;
        };
        if matches!(record.node_status(&report.path), NodeStatus::Cancelled) {
            debug!(
                job = %report.job_id,
                node = %report.path,
                "late completion for cancelled leaf discarded"
            );
            return;
        }

        let mut updated = record.clone();
        let event = match report.outcome.clone() {
            WorkOutcome::Completed(value) => {
                updated.apply_success(&report.path, value);
                Some(Event::JobStatusChanged {
                    job_id: report.job_id,
                    node: report.path.encode(),
                    status: "succeeded".to_string(),
                    error: None,
                })
            }
            WorkOutcome::Expanded(fragment) => {
                debug!(
                    job = %report.job_id,
                    node = %report.path,
                    "splicing dynamically generated fragment"
                );
                if updated.apply_expansion(&report.path, fragment) {
                    None
                } else {
                    let activity = leaf_activity_name(&updated.root, &report.path);
                    let detail =
                        ErrorDetail::new(activity, "expansion target is not a runnable leaf");
                    updated.apply_failure(
                        &report.path,
                        detail.clone(),
                        &RetryPolicy {
                            max_retries: 0,
                            delay: self.retry_policy.delay,
                        },
                    );
                    Some(Event::JobStatusChanged {
                        job_id: report.job_id,
                        node: report.path.encode(),
                        status: "failed".to_string(),
                        error: Some(detail.message),
                    })
                }
            }
            WorkOutcome::Failed(detail) => {
                match updated.apply_failure(&report.path, detail.clone(), &self.retry_policy) {
                    FailureDisposition::Retry { at } => {
                        debug!(
                            job = %report.job_id,
                            node = %report.path,
                            retry_at = %at,
                            "invocation failed, retry scheduled"
                        );
                        None
                    }
                    FailureDisposition::Exhausted => Some(Event::JobStatusChanged {
                        job_id: report.job_id,
                        node: report.path.encode(),
                        status: "failed".to_string(),
                        error: Some(detail.message),
                    }),
                }
            }
        };

        match self.store.save(&updated).await {
            Ok(()) => {
                self.jobs.insert(report.job_id, updated);
                if let Some(event) = event {
                    let _ = self.event_tx.send(event);
                }
                self.pump(report.job_id).await;
                self.finalize_if_terminal(report.job_id).await;
            }
            Err(e) => {
                warn!(
                    job = %report.job_id,
                    node = %report.path,
                    error = %e,
                    "store rejected completion, requeueing"
                );
                let tx = self.completion_tx.clone();
                let backoff = self.retry_timer_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send_async(report).await;
                });
            }
        }
    }

    async fn finalize_if_terminal(&mut self, job_id: JobId) {
        let Some(record) = self.jobs.get(&job_id) else {
            return;
        };
        let status = record.job_status();
        if !status.is_terminal() {
            return;
        }
        info!(job = %job_id, status = status.label(), "job reached terminal status");
        let _ = self.event_tx.send(Event::JobCompleted { job_id, status });
        // The record stays in the store until cleanup; late completions for
        // leaves still running at cancellation are discarded from here on.
        self.jobs.remove(&job_id);
    }
}

fn leaf_activity_name(root: &Activity, path: &NodePath) -> String {
    match root.node_at(path) {
        Some(Activity::Run { invocation, .. }) => invocation.activity.clone(),
        _ => "unknown".to_string(),
    }
}

fn collect_unknown(activity: &Activity, registry: &ActivityRegistry, out: &mut Vec<String>) {
    if let Activity::Run { invocation, .. } = activity {
        if registry.get(&invocation.activity).is_none() && !out.contains(&invocation.activity) {
            out.push(invocation.activity.clone());
        }
    }
    for child in activity.children() {
        collect_unknown(child, registry, out);
    }
}
