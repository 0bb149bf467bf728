//! Durable job records and the per-node state machine.
//!
//! A [`JobRecord`] is the authoritative state of one scheduled activity
//! graph: the graph snapshot (including spliced expansions), per-leaf
//! statuses, stored results, and cancellation markers. Composite node states
//! are never stored; they are derived deterministically from leaf statuses
//! plus the graph shape, so a record rehydrated from the store resumes at
//! exactly the node it left off.
//!
//! Leaf lifecycle: `Pending → Ready → Running → {Succeeded | Failed}`.
//! `Failed` with remaining retries carries a due time and returns to `Ready`
//! when the retry timer revives it; with retries exhausted it is terminal and
//! surfaces through the enclosing combinators.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::activity::{Activity, Invocation, NodePath};

/// Unique identifier of one scheduled job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id used to cancel one or more jobs together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StopToken(pub Uuid);

impl StopToken {
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StopToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Captured error context from a failed invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub activity: String,
    pub message: String,
    pub when: DateTime<Utc>,
}

impl ErrorDetail {
    pub fn new(activity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            message: message.into(),
            when: Utc::now(),
        }
    }
}

/// Persisted status of one `Run` leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    Ready,
    Running,
    Succeeded,
    /// The invocation returned a graph fragment; the leaf completes when the
    /// spliced fragment does.
    Expanded,
    Failed {
        attempts: u32,
        /// Due time of the next retry; `None` means retries are exhausted and
        /// the failure is terminal.
        retry_at: Option<DateTime<Utc>>,
        error: ErrorDetail,
    },
    Cancelled,
}

impl NodeStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Expanded => "expanded",
            NodeStatus::Failed { .. } => "failed",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

/// Job-level status derived from the root node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Retry ceiling and backoff applied to failing leaves.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; `2` means three runs total.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(1),
        }
    }
}

/// Disposition of a reported failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The leaf will be revived at the given time.
    Retry { at: DateTime<Utc> },
    /// Retries exhausted; the failure is terminal for the leaf.
    Exhausted,
}

/// Derived execution state of a node (leaf or composite).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Eval {
    /// Work remaining somewhere in the subtree.
    Active,
    Succeeded,
    /// Terminal failure, unrecovered at this level.
    Failed,
    /// Terminal cancellation; `recovered` is set once the compensating
    /// continuation of the owning `Cancelled` combinator succeeded.
    Cancelled { recovered: bool },
}

/// A leaf ready for dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadyNode {
    pub path: NodePath,
    pub invocation: Invocation,
}

/// Durable state of one scheduled job. Owned exclusively by the scheduler;
/// the dispatcher only reads assigned leaves and reports outcomes back.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    pub job_id: JobId,
    pub stop_token: Option<StopToken>,
    pub root: Activity,
    pub statuses: FxHashMap<NodePath, NodeStatus>,
    pub results: FxHashMap<NodePath, Value>,
    /// Failure counts per leaf. Kept outside the status so attempts survive
    /// the revival of a retried leaf back through `Ready` and `Running`.
    pub attempts: FxHashMap<NodePath, u32>,
    pub cancel_requested: bool,
    /// `Cancelled` combinator paths that observed the stop signal while
    /// their inner graph was still outstanding.
    pub cancelled_scopes: FxHashSet<NodePath>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    #[must_use]
    pub fn new(root: Activity, stop_token: Option<StopToken>) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::random(),
            stop_token,
            root,
            statuses: FxHashMap::default(),
            results: FxHashMap::default(),
            attempts: FxHashMap::default(),
            cancel_requested: false,
            cancelled_scopes: FxHashSet::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Status of one leaf; unrecorded leaves are `Pending`.
    #[must_use]
    pub fn node_status(&self, path: &NodePath) -> NodeStatus {
        self.statuses.get(path).cloned().unwrap_or_default()
    }

    /// Stored result payload of one leaf, if any.
    #[must_use]
    pub fn result(&self, path: &NodePath) -> Option<&Value> {
        self.results.get(path)
    }

    /// Job-level status derived from the root evaluation.
    #[must_use]
    pub fn job_status(&self) -> JobStatus {
        match self.eval_node(&self.root, &NodePath::root()) {
            Eval::Active => JobStatus::Running,
            Eval::Succeeded => JobStatus::Succeeded,
            Eval::Failed => JobStatus::Failed,
            Eval::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.job_status().is_terminal()
    }

    /// Walk the graph, promote eligible `Pending` leaves to `Ready`, and
    /// return every leaf currently in `Ready` (including leaves left `Ready`
    /// by an earlier admission rejection or a revived retry).
    pub fn collect_ready(&mut self) -> Vec<ReadyNode> {
        let mut ready = Vec::new();
        let root = self.root.clone();
        self.descend_normal(&root, &NodePath::root(), &mut ready);
        if !ready.is_empty() {
            self.touch();
        }
        ready
    }

    /// Mark a leaf as handed to a worker.
    pub fn mark_running(&mut self, path: &NodePath) {
        self.statuses.insert(path.clone(), NodeStatus::Running);
        self.touch();
    }

    /// Record a successful invocation with its result payload.
    pub fn apply_success(&mut self, path: &NodePath, value: Value) {
        self.statuses.insert(path.clone(), NodeStatus::Succeeded);
        self.results.insert(path.clone(), value);
        self.attempts.remove(path);
        self.touch();
    }

    /// Splice a dynamically generated fragment beneath a `Run` leaf.
    ///
    /// The fragment root takes identity `path.child(0)`; the leaf completes
    /// only once the fragment reaches terminal success.
    pub fn apply_expansion(&mut self, path: &NodePath, fragment: Activity) -> bool {
        let Some(node) = self.root.node_at_mut(path) else {
            return false;
        };
        let Activity::Run { expansion, .. } = node else {
            return false;
        };
        *expansion = Some(Box::new(fragment));
        self.statuses.insert(path.clone(), NodeStatus::Expanded);
        self.touch();
        true
    }

    /// Record a failed invocation, scheduling a retry while the ceiling
    /// allows. A small jitter is added to the delay.
    pub fn apply_failure(
        &mut self,
        path: &NodePath,
        error: ErrorDetail,
        policy: &RetryPolicy,
    ) -> FailureDisposition {
        let attempts = self.attempts.get(path).copied().unwrap_or(0) + 1;
        self.attempts.insert(path.clone(), attempts);
        let disposition = if attempts <= policy.max_retries {
            let jitter_ms = rand::rng().random_range(0..=policy.delay.as_millis().max(1) / 10);
            let at = Utc::now()
                + chrono::Duration::from_std(policy.delay).unwrap_or_default()
                + chrono::Duration::milliseconds(jitter_ms as i64);
            FailureDisposition::Retry { at }
        } else {
            FailureDisposition::Exhausted
        };
        let retry_at = match &disposition {
            FailureDisposition::Retry { at } => Some(*at),
            FailureDisposition::Exhausted => None,
        };
        self.statuses.insert(
            path.clone(),
            NodeStatus::Failed {
                attempts,
                retry_at,
                error,
            },
        );
        self.touch();
        disposition
    }

    /// Revive failed leaves whose retry delay has elapsed. Returns the
    /// revived paths.
    pub fn revive_due_retries(&mut self, now: DateTime<Utc>) -> Vec<NodePath> {
        let due: Vec<NodePath> = self
            .statuses
            .iter()
            .filter_map(|(path, status)| match status {
                NodeStatus::Failed {
                    retry_at: Some(at), ..
                } if *at <= now => Some(path.clone()),
                _ => None,
            })
            .collect();
        for path in &due {
            self.statuses.insert(path.clone(), NodeStatus::Ready);
        }
        if !due.is_empty() {
            self.touch();
        }
        due
    }

    /// Observe the job's stop signal.
    ///
    /// Every `Cancelled` combinator whose inner graph is still outstanding is
    /// activated; not-yet-started leaves inside those scopes transition to
    /// `Cancelled` (running leaves finish cooperatively and their late
    /// completions are discarded). Leaves outside any `Cancelled` scope are
    /// unaffected. Returns the leaves that were cancelled.
    pub fn request_cancel(&mut self) -> Vec<NodePath> {
        self.cancel_requested = true;
        let root = self.root.clone();
        self.activate_scopes(&root, &NodePath::root());
        let mut cancelled = Vec::new();
        for scope in self.cancelled_scopes.clone() {
            let inner = match self.root.node_at(&scope) {
                Some(Activity::Cancelled { inner, .. }) => Some((**inner).clone()),
                _ => None,
            };
            if let Some(inner) = inner {
                self.cancel_leaves(&inner, &scope.child(0), &mut cancelled);
            }
        }
        if !cancelled.is_empty() || !self.cancelled_scopes.is_empty() {
            self.touch();
        }
        cancelled
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn activate_scopes(&mut self, node: &Activity, path: &NodePath) {
        if let Activity::Cancelled { .. } = node {
            if !self.cancelled_scopes.contains(path) {
                let eval = self.eval_node(node, path);
                if eval == Eval::Active {
                    self.cancelled_scopes.insert(path.clone());
                }
            }
        }
        for (i, child) in node.children().into_iter().enumerate() {
            self.activate_scopes(child, &path.child(i as u32));
        }
    }

    fn cancel_leaves(&mut self, node: &Activity, path: &NodePath, out: &mut Vec<NodePath>) {
        match node {
            Activity::Run { expansion, .. } => {
                match self.node_status(path) {
                    NodeStatus::Pending | NodeStatus::Ready => {
                        self.statuses.insert(path.clone(), NodeStatus::Cancelled);
                        out.push(path.clone());
                    }
                    _ => {}
                }
                if let Some(fragment) = expansion {
                    self.cancel_leaves(fragment, &path.child(0), out);
                }
            }
            // A nested Cancelled scope keeps its own continuation runnable;
            // only its inner graph is swept.
            Activity::Cancelled { inner, .. } => {
                self.cancel_leaves(inner, &path.child(0), out);
            }
            _ => {
                for (i, child) in node.children().into_iter().enumerate() {
                    self.cancel_leaves(child, &path.child(i as u32), out);
                }
            }
        }
    }

    /// Derived execution state of the node at `path`.
    pub(crate) fn eval_node(&self, node: &Activity, path: &NodePath) -> Eval {
        match node {
            Activity::Run { expansion, .. } => match self.node_status(path) {
                NodeStatus::Succeeded => Eval::Succeeded,
                NodeStatus::Expanded => match expansion {
                    Some(fragment) => self.eval_node(fragment, &path.child(0)),
                    None => Eval::Active,
                },
                NodeStatus::Failed { retry_at: None, .. } => Eval::Failed,
                NodeStatus::Cancelled => Eval::Cancelled { recovered: false },
                _ => Eval::Active,
            },
            Activity::Sequence(children) => {
                for (i, child) in children.iter().enumerate() {
                    match self.eval_node(child, &path.child(i as u32)) {
                        Eval::Succeeded => continue,
                        other => return other,
                    }
                }
                Eval::Succeeded
            }
            Activity::Parallel(children) => {
                let mut any_failed = false;
                let mut any_cancelled = false;
                let mut all_recovered = true;
                for (i, child) in children.iter().enumerate() {
                    match self.eval_node(child, &path.child(i as u32)) {
                        Eval::Active => return Eval::Active,
                        Eval::Succeeded => {}
                        Eval::Failed => any_failed = true,
                        Eval::Cancelled { recovered } => {
                            any_cancelled = true;
                            all_recovered &= recovered;
                        }
                    }
                }
                if any_failed {
                    Eval::Failed
                } else if any_cancelled {
                    Eval::Cancelled {
                        recovered: all_recovered,
                    }
                } else {
                    Eval::Succeeded
                }
            }
            Activity::ExceptionFilter { inner, filter } => {
                match self.eval_node(inner, &path.child(0)) {
                    Eval::Failed => match self.eval_node(filter, &path.child(1)) {
                        // The filter observes but never suppresses.
                        Eval::Active => Eval::Active,
                        _ => Eval::Failed,
                    },
                    other => other,
                }
            }
            Activity::Failed {
                inner,
                continuation,
            }
            | Activity::AnyFailed {
                inner,
                continuation,
            } => match self.eval_node(inner, &path.child(0)) {
                Eval::Failed => self.eval_node(continuation, &path.child(1)),
                other => other,
            },
            Activity::Cancelled {
                inner,
                continuation,
            } => {
                if self.cancelled_scopes.contains(path) {
                    match self.eval_node(continuation, &path.child(1)) {
                        Eval::Succeeded => Eval::Cancelled { recovered: true },
                        other => other,
                    }
                } else {
                    self.eval_node(inner, &path.child(0))
                }
            }
            Activity::ThenContinue { inner } => match self.eval_node(inner, &path.child(0)) {
                Eval::Cancelled { recovered: true } => Eval::Succeeded,
                other => other,
            },
        }
    }

    fn descend_normal(&mut self, node: &Activity, path: &NodePath, out: &mut Vec<ReadyNode>) {
        match node {
            Activity::Run {
                invocation,
                expansion,
            } => match self.node_status(path) {
                NodeStatus::Pending => {
                    self.statuses.insert(path.clone(), NodeStatus::Ready);
                    out.push(ReadyNode {
                        path: path.clone(),
                        invocation: invocation.clone(),
                    });
                }
                NodeStatus::Ready => {
                    out.push(ReadyNode {
                        path: path.clone(),
                        invocation: invocation.clone(),
                    });
                }
                NodeStatus::Expanded => {
                    if let Some(fragment) = expansion {
                        self.descend_normal(fragment, &path.child(0), out);
                    }
                }
                _ => {}
            },
            Activity::Sequence(children) => {
                for (i, child) in children.iter().enumerate() {
                    match self.eval_node(child, &path.child(i as u32)) {
                        Eval::Succeeded => continue,
                        Eval::Active => {
                            self.descend_normal(child, &path.child(i as u32), out);
                            break;
                        }
                        // A failed or cancelled child gates the rest of the
                        // sequence; recovery belongs to enclosing combinators.
                        _ => break,
                    }
                }
            }
            Activity::Parallel(children) => {
                for (i, child) in children.iter().enumerate() {
                    if self.eval_node(child, &path.child(i as u32)) == Eval::Active {
                        self.descend_normal(child, &path.child(i as u32), out);
                    }
                }
            }
            Activity::ExceptionFilter { inner, filter } => {
                match self.eval_node(inner, &path.child(0)) {
                    Eval::Active => self.descend_normal(inner, &path.child(0), out),
                    Eval::Failed => self.descend_normal(filter, &path.child(1), out),
                    _ => {}
                }
            }
            Activity::Failed {
                inner,
                continuation,
            }
            | Activity::AnyFailed {
                inner,
                continuation,
            } => match self.eval_node(inner, &path.child(0)) {
                Eval::Active => self.descend_normal(inner, &path.child(0), out),
                Eval::Failed => self.descend_normal(continuation, &path.child(1), out),
                _ => {}
            },
            Activity::Cancelled {
                inner,
                continuation,
            } => {
                if self.cancelled_scopes.contains(path) {
                    self.descend_normal(continuation, &path.child(1), out);
                    self.descend_cancel_sweep(inner, &path.child(0), out);
                } else {
                    self.descend_normal(inner, &path.child(0), out);
                }
            }
            Activity::ThenContinue { inner } => {
                self.descend_normal(inner, &path.child(0), out);
            }
        }
    }

    /// Inside a cancelled scope, only nested activated scopes still produce
    /// work (their compensating continuations).
    fn descend_cancel_sweep(&mut self, node: &Activity, path: &NodePath, out: &mut Vec<ReadyNode>) {
        match node {
            Activity::Cancelled {
                inner,
                continuation,
            } => {
                if self.cancelled_scopes.contains(path) {
                    self.descend_normal(continuation, &path.child(1), out);
                }
                self.descend_cancel_sweep(inner, &path.child(0), out);
            }
            _ => {
                for (i, child) in node.children().into_iter().enumerate() {
                    self.descend_cancel_sweep(child, &path.child(i as u32), out);
                }
            }
        }
    }
}
