//! Serializable invocation descriptors for user activities.
//!
//! An [`Invocation`] is the persisted form of "call this activity with these
//! arguments": an activity-type name plus ordered JSON argument values. It
//! deliberately carries no live closures so a job can be dispatched purely
//! from stored data, including after a process restart.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Target activity type plus captured arguments for one `Run` node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Registered activity-type name, e.g. `"Greet"`.
    pub activity: String,
    /// Ordered argument values handed to the activity handler.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument value.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Value>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the full argument list.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}
