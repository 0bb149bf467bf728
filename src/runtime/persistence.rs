/*!
Serde-friendly persisted shapes for job records, decoupled from the
in-memory representation so store backends stay lean and declarative.

This module performs no I/O. It is pure data transformation and
(de)serialization glue shared by every [`JobStore`](super::store::JobStore)
implementation.
*/

use chrono::Utc;
use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::activity::{Activity, NodePath};
use crate::job::{JobId, JobRecord, NodeStatus, StopToken};

/// Full persisted representation of one job record.
///
/// Paths are stored in their encoded string form (`"$"`, `"$.1.0"`) and
/// timestamps as RFC3339 strings, keeping the serialized shape free of
/// crate-internal key types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedJob {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_token: Option<String>,
    pub root: Activity,
    #[serde(default)]
    pub statuses: FxHashMap<String, NodeStatus>,
    #[serde(default)]
    pub results: FxHashMap<String, Value>,
    #[serde(default)]
    pub attempts: FxHashMap<String, u32>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub cancelled_scopes: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Conversion and serialization errors for persisted job models.
#[derive(Debug, Error, Diagnostic)]
pub enum PersistenceError {
    #[error("invalid uuid in field {field}: {value}")]
    #[diagnostic(
        code(duraflow::persistence::bad_uuid),
        help("The stored row is corrupt; job_id and stop_token must be uuids.")
    )]
    BadUuid { field: &'static str, value: String },

    #[error("invalid node path: {0}")]
    #[diagnostic(
        code(duraflow::persistence::bad_path),
        help("Node paths are encoded as `$` or `$.<idx>.<idx>`.")
    )]
    BadPath(String),

    #[error("JSON serialization/deserialization failed: {source}")]
    #[diagnostic(
        code(duraflow::persistence::serde),
        help("Ensure the stored payload matches the PersistedJob shape.")
    )]
    Serde {
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistedJob {
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| PersistenceError::Serde { source: e })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| PersistenceError::Serde { source: e })
    }
}

impl From<&JobRecord> for PersistedJob {
    fn from(record: &JobRecord) -> Self {
        PersistedJob {
            job_id: record.job_id.to_string(),
            stop_token: record.stop_token.map(|t| t.to_string()),
            root: record.root.clone(),
            statuses: record
                .statuses
                .iter()
                .map(|(path, status)| (path.encode(), status.clone()))
                .collect(),
            results: record
                .results
                .iter()
                .map(|(path, value)| (path.encode(), value.clone()))
                .collect(),
            attempts: record
                .attempts
                .iter()
                .map(|(path, count)| (path.encode(), *count))
                .collect(),
            cancel_requested: record.cancel_requested,
            cancelled_scopes: record.cancelled_scopes.iter().map(NodePath::encode).collect(),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

impl TryFrom<PersistedJob> for JobRecord {
    type Error = PersistenceError;

    fn try_from(p: PersistedJob) -> Result<Self> {
        let job_id = JobId(parse_uuid("job_id", &p.job_id)?);
        let stop_token = match &p.stop_token {
            Some(raw) => Some(StopToken(parse_uuid("stop_token", raw)?)),
            None => None,
        };
        let mut statuses = FxHashMap::default();
        for (raw, status) in p.statuses {
            statuses.insert(decode_path(&raw)?, status);
        }
        let mut results = FxHashMap::default();
        for (raw, value) in p.results {
            results.insert(decode_path(&raw)?, value);
        }
        let mut attempts = FxHashMap::default();
        for (raw, count) in p.attempts {
            attempts.insert(decode_path(&raw)?, count);
        }
        let mut cancelled_scopes = FxHashSet::default();
        for raw in &p.cancelled_scopes {
            cancelled_scopes.insert(decode_path(raw)?);
        }
        let created_at = parse_time(&p.created_at);
        let updated_at = parse_time(&p.updated_at);
        Ok(JobRecord {
            job_id,
            stop_token,
            root: p.root,
            statuses,
            results,
            attempts,
            cancel_requested: p.cancel_requested,
            cancelled_scopes,
            created_at,
            updated_at,
        })
    }
}

fn parse_uuid(field: &'static str, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| PersistenceError::BadUuid {
        field,
        value: raw.to_string(),
    })
}

fn decode_path(raw: &str) -> Result<NodePath> {
    NodePath::decode(raw).ok_or_else(|| PersistenceError::BadPath(raw.to_string()))
}

fn parse_time(raw: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
