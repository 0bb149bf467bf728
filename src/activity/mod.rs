//! Activity graphs: the persisted execution plan of a job.
//!
//! An [`Activity`] is an immutable tree built from combinators. Each
//! combinator wraps a prior graph and returns a new value; nothing is edited
//! in place. The whole tree is serializable, so a job's plan (including any
//! fragments spliced at runtime by dynamic expansion) survives a restart.
//!
//! Node identity is positional: see [`NodePath`]. Child slots are fixed per
//! variant so identity derivation is deterministic:
//!
//! - `Run`: expansion fragment (if spliced) at child 0
//! - `Sequence` / `Parallel`: children in declaration order
//! - `ExceptionFilter`, `Failed`, `AnyFailed`, `Cancelled`: inner at child 0,
//!   filter/continuation at child 1
//! - `ThenContinue`: inner at child 0

pub mod invocation;
pub mod path;

pub use invocation::Invocation;
pub use path::NodePath;

use serde::{Deserialize, Serialize};

/// One node of an activity graph.
///
/// Built with the fluent combinator API and never mutated afterwards, except
/// that the engine splices dynamic expansion fragments into `Run` nodes of a
/// job's private snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Activity {
    /// Invoke one user activity. May return a plain value or a new graph
    /// fragment to execute before this node is considered complete.
    Run {
        invocation: Invocation,
        /// Fragment returned by the invocation at runtime, spliced in by the
        /// scheduler. Never set on a caller-built graph.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expansion: Option<Box<Activity>>,
    },
    /// Children execute strictly in order; each starts only after the prior
    /// one succeeded.
    Sequence(Vec<Activity>),
    /// Children execute concurrently; the node completes once every child is
    /// terminal. A failing child does not cancel its siblings.
    Parallel(Vec<Activity>),
    /// Observe failures of `inner`: when `inner` fails terminally the filter
    /// activity runs first (e.g. logging), then the failure still propagates.
    /// The filter never suppresses the failure.
    ExceptionFilter {
        inner: Box<Activity>,
        filter: Box<Activity>,
    },
    /// If `inner` fails terminally (retries exhausted), run `continuation`
    /// instead of propagating the failure.
    Failed {
        inner: Box<Activity>,
        continuation: Box<Activity>,
    },
    /// Composite-inner spelling of [`Failed`](Activity::Failed): runs the
    /// continuation once the composite `inner` is terminal with any failed
    /// branch.
    AnyFailed {
        inner: Box<Activity>,
        continuation: Box<Activity>,
    },
    /// If the job's stop signal is observed while `inner` is outstanding,
    /// stop progressing `inner` and run `continuation` as the compensating
    /// action.
    Cancelled {
        inner: Box<Activity>,
        continuation: Box<Activity>,
    },
    /// Rejoin marker: a recovered cancellation of `inner` reads as success so
    /// subsequent [`then`](Activity::then) chaining follows the recovery
    /// branch instead of terminating the job.
    ThenContinue { inner: Box<Activity> },
}

impl Activity {
    /// Leaf node invoking one activity.
    #[must_use]
    pub fn run(invocation: Invocation) -> Self {
        Activity::Run {
            invocation,
            expansion: None,
        }
    }

    /// Children executing strictly in order.
    #[must_use]
    pub fn sequence(children: impl IntoIterator<Item = Activity>) -> Self {
        Activity::Sequence(children.into_iter().collect())
    }

    /// Children executing concurrently with an all-done join.
    #[must_use]
    pub fn parallel(children: impl IntoIterator<Item = Activity>) -> Self {
        Activity::Parallel(children.into_iter().collect())
    }

    /// Chain `next` after this graph. A trailing sequence is extended rather
    /// than nested so long chains keep flat identities.
    #[must_use]
    pub fn then(self, next: Activity) -> Self {
        match self {
            Activity::Sequence(mut children) => {
                children.push(next);
                Activity::Sequence(children)
            }
            other => Activity::Sequence(vec![other, next]),
        }
    }

    /// Wrap with a failure observer that runs `filter` before the failure
    /// propagates.
    #[must_use]
    pub fn exception_filter(self, filter: Invocation) -> Self {
        Activity::ExceptionFilter {
            inner: Box::new(self),
            filter: Box::new(Activity::run(filter)),
        }
    }

    /// Recover a terminal failure of this graph by running `continuation`.
    #[must_use]
    pub fn failed(self, continuation: Activity) -> Self {
        Activity::Failed {
            inner: Box::new(self),
            continuation: Box::new(continuation),
        }
    }

    /// Recover when any branch of this composite graph failed terminally.
    #[must_use]
    pub fn any_failed(self, continuation: Activity) -> Self {
        Activity::AnyFailed {
            inner: Box::new(self),
            continuation: Box::new(continuation),
        }
    }

    /// Run `continuation` as the compensating action when the job's stop
    /// signal is observed while this graph is outstanding.
    #[must_use]
    pub fn cancelled(self, continuation: Activity) -> Self {
        Activity::Cancelled {
            inner: Box::new(self),
            continuation: Box::new(continuation),
        }
    }

    /// Mark that subsequent `then` chaining should follow the recovery branch
    /// after a handled cancellation.
    #[must_use]
    pub fn then_continue(self) -> Self {
        Activity::ThenContinue {
            inner: Box::new(self),
        }
    }

    /// Child nodes in identity order (see module docs for slot layout).
    pub fn children(&self) -> Vec<&Activity> {
        match self {
            Activity::Run { expansion, .. } => {
                expansion.iter().map(AsRef::as_ref).collect()
            }
            Activity::Sequence(children) | Activity::Parallel(children) => {
                children.iter().collect()
            }
            Activity::ExceptionFilter { inner, filter } => vec![inner, filter],
            Activity::Failed {
                inner,
                continuation,
            }
            | Activity::AnyFailed {
                inner,
                continuation,
            }
            | Activity::Cancelled {
                inner,
                continuation,
            } => vec![inner, continuation],
            Activity::ThenContinue { inner } => vec![inner],
        }
    }

    /// Resolve the node at `path`, or `None` if the path does not exist in
    /// this graph (e.g. an expansion not yet spliced).
    pub fn node_at(&self, path: &NodePath) -> Option<&Activity> {
        let mut node = self;
        for seg in path.segments() {
            node = node.child(*seg)?;
        }
        Some(node)
    }

    /// Mutable resolution used by the engine when splicing expansions.
    pub(crate) fn node_at_mut(&mut self, path: &NodePath) -> Option<&mut Activity> {
        let mut node = self;
        for seg in path.segments() {
            node = node.child_mut(*seg)?;
        }
        Some(node)
    }

    fn child(&self, index: u32) -> Option<&Activity> {
        match self {
            Activity::Run { expansion, .. } => match index {
                0 => expansion.as_deref(),
                _ => None,
            },
            Activity::Sequence(children) | Activity::Parallel(children) => {
                children.get(index as usize)
            }
            Activity::ExceptionFilter { inner, filter } => match index {
                0 => Some(inner),
                1 => Some(filter),
                _ => None,
            },
            Activity::Failed {
                inner,
                continuation,
            }
            | Activity::AnyFailed {
                inner,
                continuation,
            }
            | Activity::Cancelled {
                inner,
                continuation,
            } => match index {
                0 => Some(inner),
                1 => Some(continuation),
                _ => None,
            },
            Activity::ThenContinue { inner } => match index {
                0 => Some(inner),
                _ => None,
            },
        }
    }

    fn child_mut(&mut self, index: u32) -> Option<&mut Activity> {
        match self {
            Activity::Run { expansion, .. } => match index {
                0 => expansion.as_deref_mut(),
                _ => None,
            },
            Activity::Sequence(children) | Activity::Parallel(children) => {
                children.get_mut(index as usize)
            }
            Activity::ExceptionFilter { inner, filter } => match index {
                0 => Some(inner),
                1 => Some(filter),
                _ => None,
            },
            Activity::Failed {
                inner,
                continuation,
            }
            | Activity::AnyFailed {
                inner,
                continuation,
            }
            | Activity::Cancelled {
                inner,
                continuation,
            } => match index {
                0 => Some(inner),
                1 => Some(continuation),
                _ => None,
            },
            Activity::ThenContinue { inner } => match index {
                0 => Some(inner),
                _ => None,
            },
        }
    }
}
