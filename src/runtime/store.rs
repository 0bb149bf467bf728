//! The durable persistence contract and the in-memory reference store.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::job::{JobId, JobRecord};

use super::persistence::{PersistedJob, PersistenceError};

/// Failures surfaced by a store backend.
///
/// The scheduler treats any save failure as "state not advanced": the
/// completion that triggered the write is requeued and applied again later,
/// so observable progress never outruns what the store accepted.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("job {0} not found")]
    #[diagnostic(code(duraflow::store::not_found))]
    NotFound(JobId),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("store backend failure: {0}")]
    #[diagnostic(code(duraflow::store::backend))]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage for job records, injected into the scheduler.
///
/// `save` must be atomic per job: a reader never observes a half-written
/// record. Keys are job ids; writes replace the whole record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist the full record, replacing any previous version.
    async fn save(&self, record: &JobRecord) -> Result<()>;

    /// Load one record.
    async fn load(&self, job_id: JobId) -> Result<JobRecord>;

    /// Every record whose job has not reached a terminal status. Used on
    /// startup to resume interrupted jobs.
    async fn list_due(&self) -> Result<Vec<JobRecord>>;

    /// Remove one record. Removing an unknown id is not an error.
    async fn delete(&self, job_id: JobId) -> Result<()>;
}

/// Non-durable store for tests and embedded use.
///
/// Records are held in their persisted form, so every save and load exercises
/// the same conversion path a durable backend uses.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<FxHashMap<JobId, PersistedJob>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, record: &JobRecord) -> Result<()> {
        let persisted = PersistedJob::from(record);
        self.jobs.write().insert(record.job_id, persisted);
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord> {
        let persisted = self
            .jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))?;
        Ok(JobRecord::try_from(persisted)?)
    }

    async fn list_due(&self) -> Result<Vec<JobRecord>> {
        let snapshot: Vec<PersistedJob> = self.jobs.read().values().cloned().collect();
        let mut due = Vec::new();
        for persisted in snapshot {
            let record = JobRecord::try_from(persisted)?;
            if !record.is_terminal() {
                due.push(record);
            }
        }
        Ok(due)
    }

    async fn delete(&self, job_id: JobId) -> Result<()> {
        self.jobs.write().remove(&job_id);
        Ok(())
    }
}
