//! Fluent configuration for the orchestrator runtime.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::dispatcher::WorkerConfig;
use crate::event_bus::EventBus;
use crate::job::RetryPolicy;
use crate::registry::{ActivityHandler, ActivityRegistry};

use super::scheduler::{Scheduler, SchedulerError};
use super::store::JobStore;

/// Everything the scheduler needs before it can start: the activity
/// registry, retry behaviour, per-activity worker sizing, and event sinks.
///
/// ```ignore
/// let scheduler = OrchestratorConfig::new()
///     .set_default_retry_count(2)
///     .set_default_retry_delay(Duration::from_secs(1))
///     .activity("greet", greet_handler)
///     .activity_with("render", render_handler, WorkerConfig::new(3, 3))
///     .start(Arc::new(InMemoryJobStore::new()))
///     .await?;
/// ```
pub struct OrchestratorConfig {
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) retry_timer_interval: Duration,
    pub(crate) default_worker: WorkerConfig,
    pub(crate) worker_configs: FxHashMap<String, WorkerConfig>,
    pub(crate) registry: ActivityRegistry,
    pub(crate) event_bus: EventBus,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            retry_timer_interval: Duration::from_millis(200),
            default_worker: WorkerConfig::default(),
            worker_configs: FxHashMap::default(),
            registry: ActivityRegistry::new(),
            event_bus: EventBus::default(),
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries applied after a leaf's first failed attempt. `2` means three
    /// runs total.
    #[must_use]
    pub fn set_default_retry_count(mut self, count: u32) -> Self {
        self.retry_policy.max_retries = count;
        self
    }

    /// Base delay before a failed leaf becomes due again.
    #[must_use]
    pub fn set_default_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_policy.delay = delay;
        self
    }

    /// How often the scheduler loop wakes to revive due retries.
    #[must_use]
    pub fn set_retry_timer_interval(mut self, interval: Duration) -> Self {
        self.retry_timer_interval = interval;
        self
    }

    /// Queue and pool sizing for activities without an explicit config.
    #[must_use]
    pub fn set_default_worker(mut self, config: WorkerConfig) -> Self {
        self.default_worker = config;
        self
    }

    /// Register an activity handler under `name` with default worker sizing.
    #[must_use]
    pub fn activity<H>(self, name: impl Into<String>, handler: H) -> Self
    where
        H: ActivityHandler + 'static,
    {
        let name = name.into();
        let default = self.default_worker;
        self.activity_with(name, handler, default)
    }

    /// Register an activity handler with its own queue and pool sizing.
    #[must_use]
    pub fn activity_with<H>(
        mut self,
        name: impl Into<String>,
        handler: H,
        config: WorkerConfig,
    ) -> Self
    where
        H: ActivityHandler + 'static,
    {
        let name = name.into();
        self.worker_configs.insert(name.clone(), config);
        self.registry.insert(name, Arc::new(handler));
        self
    }

    /// Replace the default stdout event bus.
    #[must_use]
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Start the scheduler: recover non-terminal jobs from the store, spawn
    /// the worker pools and the single-writer loop, and begin listening for
    /// events.
    pub async fn start(self, store: Arc<dyn JobStore>) -> Result<Scheduler, SchedulerError> {
        Scheduler::start(self, store).await
    }
}
