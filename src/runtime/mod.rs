//! The orchestrator runtime: configuration, the scheduler loop, and job
//! stores.
//!
//! A runtime is assembled from an [`OrchestratorConfig`] (activity registry,
//! retry behaviour, worker sizing, event sinks) plus a [`JobStore`], and
//! started with [`OrchestratorConfig::start`]. The returned [`Scheduler`]
//! handle is the whole public control surface: schedule, stop, query,
//! cleanup, shutdown.

pub mod config;
pub mod persistence;
pub mod scheduler;
pub mod store;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;

pub use config::OrchestratorConfig;
pub use persistence::{PersistedJob, PersistenceError};
pub use scheduler::{Scheduler, SchedulerError};
pub use store::{InMemoryJobStore, JobStore, StoreError};
#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteJobStore;
