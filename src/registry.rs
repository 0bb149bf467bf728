//! Activity registration: the single execution contract for user code.
//!
//! User activities implement [`ActivityHandler`] and are registered by
//! type name. The dispatcher resolves invocations by name and hands over the
//! stored argument values; a handler may return a plain result value or a new
//! [`Activity`] fragment to splice into the running job.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::activity::Activity;

/// Outcome of one activity invocation.
#[derive(Clone, Debug)]
pub enum ActivityReturn {
    /// Final result payload for the node.
    Value(Value),
    /// A dynamically generated graph fragment to execute before the node is
    /// considered complete.
    Expand(Activity),
}

impl ActivityReturn {
    /// Unit result for activities with nothing to report.
    #[must_use]
    pub fn done() -> Self {
        ActivityReturn::Value(Value::Null)
    }
}

/// Failure raised by a user activity.
#[derive(Debug, Error, Diagnostic)]
pub enum ActivityError {
    /// The activity raised an application error.
    #[error("{message}")]
    #[diagnostic(code(duraflow::activity::raised))]
    Raised { message: String },

    /// The stored arguments did not match what the activity expects.
    #[error("bad arguments for {activity}: {message}")]
    #[diagnostic(
        code(duraflow::activity::bad_args),
        help("Check the argument values captured in the Run invocation.")
    )]
    BadArguments { activity: String, message: String },

    /// Argument deserialization failed.
    #[error(transparent)]
    #[diagnostic(code(duraflow::activity::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl ActivityError {
    pub fn raised(message: impl Into<String>) -> Self {
        Self::Raised {
            message: message.into(),
        }
    }
}

/// The execution contract consumed from user code.
///
/// Implementations must be stateless with respect to a single invocation:
/// the engine may re-invoke a node whose completion was not durably recorded
/// before a crash, so side effects should be idempotent per node identity.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, args: &[Value]) -> Result<ActivityReturn, ActivityError>;
}

/// Closure adapter so small activities need no dedicated type.
pub struct FnActivity<F>(F);

impl<F> FnActivity<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActivityReturn, ActivityError>> + Send,
{
    async fn invoke(&self, args: &[Value]) -> Result<ActivityReturn, ActivityError> {
        (self.0)(args.to_vec()).await
    }
}

/// Name-keyed registry of activity handlers, immutable after construction.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: FxHashMap<String, Arc<dyn ActivityHandler>>,
}

impl ActivityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under an activity-type name, replacing any
    /// previous registration.
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn ActivityHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ActivityHandler>)> {
        self.handlers.iter().map(|(name, h)| (name.as_str(), h))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
