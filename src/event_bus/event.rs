use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobStatus};

/// Lifecycle event emitted by the scheduler on state transitions.
///
/// `JobStatusChanged` is emitted when a node reaches a terminal status;
/// transient states (ready, running, awaiting retry) are visible through
/// tracing but are not reported to sinks, so recoverable failures never read
/// as job failures.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    JobCreated {
        job_id: JobId,
    },
    JobStatusChanged {
        job_id: JobId,
        /// Encoded node path, e.g. `"$.1"`.
        node: String,
        /// Terminal node status label: `succeeded`, `failed`, or `cancelled`.
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Admission control pushed back; the node stays ready and will be
    /// resubmitted.
    JobSuspended {
        job_id: JobId,
        activity: String,
        reason: String,
    },
    JobCompleted {
        job_id: JobId,
        status: JobStatus,
    },
    Diagnostic {
        scope: String,
        message: String,
    },
}

impl Event {
    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic {
            scope: scope.into(),
            message: message.into(),
        }
    }

    /// The job this event concerns, if any.
    #[must_use]
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobCreated { job_id }
            | Event::JobStatusChanged { job_id, .. }
            | Event::JobSuspended { job_id, .. }
            | Event::JobCompleted { job_id, .. } => Some(*job_id),
            Event::Diagnostic { .. } => None,
        }
    }

    /// Compact JSON string form for structured sinks.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::JobCreated { job_id } => write!(f, "[{job_id}] job created"),
            Event::JobStatusChanged {
                job_id,
                node,
                status,
                error,
            } => match error {
                Some(error) => write!(f, "[{job_id}] {node} -> {status}: {error}"),
                None => write!(f, "[{job_id}] {node} -> {status}"),
            },
            Event::JobSuspended {
                job_id,
                activity,
                reason,
            } => write!(f, "[{job_id}] suspended ({activity}): {reason}"),
            Event::JobCompleted { job_id, status } => {
                write!(f, "[{job_id}] job completed: {}", status.label())
            }
            Event::Diagnostic { scope, message } => write!(f, "[{scope}] {message}"),
        }
    }
}
