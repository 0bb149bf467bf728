//! # Duraflow: Durable Activity Orchestration
//!
//! Duraflow runs user-defined activities composed into graphs, persisting
//! per-node progress so a job interrupted by a crash resumes from its last
//! recorded state instead of starting over.
//!
//! ## Core Concepts
//!
//! - **Atoms**: Composable units of deferred async work with monadic chaining
//! - **Activities**: Serializable execution plans built from combinators
//!   (`run`, `then`, `parallel`, failure and cancellation recovery)
//! - **Jobs**: Durable records tracking per-node status across restarts
//! - **Dispatcher**: Bounded per-activity worker pools with admission control
//! - **Scheduler**: Single-writer loop applying completions, retries, and
//!   cancellations, persisting every transition before acknowledging it
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use duraflow::activity::{Activity, Invocation};
//! use duraflow::registry::{ActivityReturn, FnActivity};
//! use duraflow::runtime::{InMemoryJobStore, OrchestratorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let scheduler = OrchestratorConfig::new()
//!         .activity(
//!             "greet",
//!             FnActivity::new(|args| async move {
//!                 println!("hello {args:?}");
//!                 Ok(ActivityReturn::done())
//!             }),
//!         )
//!         .start(Arc::new(InMemoryJobStore::new()))
//!         .await?;
//!
//!     let graph = Activity::run(Invocation::new("greet").with_arg("alice"))
//!         .then(Activity::run(Invocation::new("greet").with_arg("cooper")));
//!     let job_id = scheduler.schedule(graph).await?;
//!     println!("scheduled {job_id}");
//!     scheduler.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Guide
//!
//! - [`atom`] - Deferred async computations with `bind`/`then`/`map`
//! - [`activity`] - Graph combinators and positional node identity
//! - [`registry`] - The activity handler contract and registration
//! - [`job`] - Durable job records and the per-node state machine
//! - [`dispatcher`] - Worker pools and admission control
//! - [`runtime`] - Configuration, the scheduler, and job stores
//! - [`event_bus`] - Lifecycle events and pluggable sinks
//! - [`telemetry`] - Tracing bootstrap helpers

pub mod activity;
pub mod atom;
pub mod dispatcher;
pub mod event_bus;
pub mod job;
pub mod registry;
pub mod runtime;
pub mod telemetry;
