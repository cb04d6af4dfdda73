//! Metric Collector
//!
//! Observes Bull queues and feeds their depth and completion statistics to
//! a gauge sink.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──▶ QueueRegistry ◀── DiscoveryEngine
//!                            │
//!              ┌─────────────┼──────────────┐
//!              ▼             ▼              ▼
//!        StatsRefresher  CompletionTracker  LifecycleController
//!              │             │
//!              └──────▶  GaugeSink  ◀───────┘
//! ```

mod completion;
mod discovery;
mod lifecycle;
mod registry;
mod stats;

pub use completion::{process_completion, CompletionOutcome, CompletionTracker, TrackerStats};
pub use discovery::{DiscoveryEngine, DiscoveryReport, IDENTITY_SUFFIXES};
pub use lifecycle::LifecycleController;
pub use registry::{QueueEntry, QueueRegistry};
pub use stats::{RefreshSummary, StatsRefresher};

use std::sync::Arc;

use prometheus::Registry;

use crate::adapters::BullQueueFactory;
use crate::config::CollectorOptions;
use crate::connection::ConnectionManager;
use crate::domain::ports::{GaugeSink, KeyspaceClient, QueueFactory};
use crate::error::Result;
use crate::metrics::QueueGauges;

/// Entry point for a hosting process.
pub struct MetricCollector {
    options: CollectorOptions,
    registry: Arc<QueueRegistry>,
    discovery: DiscoveryEngine,
    refresher: StatsRefresher,
    tracker: Arc<CompletionTracker>,
    lifecycle: LifecycleController,
}

impl MetricCollector {
    /// Build a collector against Redis, registering Prometheus gauges in
    /// every registry given.
    pub fn connect<S: AsRef<str>>(
        queue_names: &[S],
        options: CollectorOptions,
        registries: &[Registry],
    ) -> Result<Self> {
        options.validate()?;

        let connections = Arc::new(ConnectionManager::new(&options.connection)?);
        let client: Arc<dyn KeyspaceClient> = Arc::new(connections.shared().clone());
        let factory: Arc<dyn QueueFactory> = Arc::new(BullQueueFactory::new(connections));
        let sink: Arc<dyn GaugeSink> = Arc::new(QueueGauges::new(&options.metric_prefix, registries)?);

        Self::with_parts(queue_names, options, client, factory, sink)
    }

    /// Build a collector from explicit adapters.
    pub fn with_parts<S: AsRef<str>>(
        queue_names: &[S],
        options: CollectorOptions,
        client: Arc<dyn KeyspaceClient>,
        factory: Arc<dyn QueueFactory>,
        sink: Arc<dyn GaugeSink>,
    ) -> Result<Self> {
        options.validate()?;

        let registry = Arc::new(QueueRegistry::new(options.prefix.clone(), factory));
        registry.add_queues(queue_names);

        let discovery = DiscoveryEngine::new(client.clone(), registry.clone())?;
        let refresher = StatsRefresher::new(registry.clone(), sink.clone());
        let tracker = Arc::new(CompletionTracker::new(registry.clone(), sink));
        let lifecycle = LifecycleController::new(client, registry.clone(), tracker.clone());

        Ok(Self {
            options,
            registry,
            discovery,
            refresher,
            tracker,
            lifecycle,
        })
    }

    /// Register queues by name. Returns the names newly added.
    pub fn add_queues<I, S>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry.add_queues(names)
    }

    /// Scan the keyspace for queues and register them.
    pub async fn discover_all(&self) -> Result<DiscoveryReport> {
        self.discovery.run().await
    }

    /// Start tracking completions on every registered queue not yet tracked.
    pub async fn collect_job_completions(&self) -> usize {
        self.tracker.enable().await
    }

    /// Refresh depth gauges for every registered queue.
    pub async fn update_all(&self) -> RefreshSummary {
        self.refresher.update_all().await
    }

    /// Liveness check on the backend.
    pub async fn ping(&self) -> Result<()> {
        self.lifecycle.ping().await
    }

    /// Disconnect, unsubscribe and close every queue. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.lifecycle.close().await
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }
}

impl std::fmt::Debug for MetricCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCollector")
            .field("prefix", &self.options.prefix)
            .field("queues", &self.registry.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}
