//! Lifecycle Controller
//!
//! Health check and teardown for the collector.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::completion::CompletionTracker;
use super::registry::QueueRegistry;
use crate::domain::ports::KeyspaceClient;
use crate::error::{Error, Result};

pub struct LifecycleController {
    client: Arc<dyn KeyspaceClient>,
    registry: Arc<QueueRegistry>,
    tracker: Arc<CompletionTracker>,
    closed: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        client: Arc<dyn KeyspaceClient>,
        registry: Arc<QueueRegistry>,
        tracker: Arc<CompletionTracker>,
    ) -> Self {
        Self {
            client,
            registry,
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// Liveness check on the shared connection.
    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(|e| match e {
            Error::Connection(_) => e,
            other => Error::Connection(other.to_string()),
        })
    }

    /// Tear everything down.
    ///
    /// Requests disconnection of the shared connection without waiting for
    /// in-flight commands, removes every tracked completion subscription and
    /// closes every queue handle. Registration and tracking stay off
    /// afterwards. All queues are closed even if some fail; the first failure
    /// is returned. Later calls are no-ops.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("collector already closed");
            return Ok(());
        }

        self.client.disconnect();
        let unsubscribed = self.tracker.disable();
        self.registry.seal();

        let entries = self.registry.list();
        let results = join_all(entries.iter().map(|entry| entry.queue.close())).await;

        let mut first_error = None;
        for (entry, result) in entries.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = %entry.name, error = %e, "failed to close queue");
                first_error.get_or_insert(e);
            }
        }

        info!(
            queues = entries.len(),
            subscriptions = unsubscribed,
            "collector closed"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryKeyspace, InMemoryQueueFactory};
    use crate::domain::ports::{CompletionStats, GaugeSink, JobCounts, JobRecord, QueueHandle};
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl GaugeSink for NullSink {
        async fn update_stats(
            &self,
            _prefix: &str,
            _name: &str,
            queue: &dyn QueueHandle,
        ) -> Result<JobCounts> {
            queue.job_counts().await
        }

        fn record_completion(
            &self,
            _prefix: &str,
            _name: &str,
            _job: &JobRecord,
            _stats: &CompletionStats,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        lifecycle: LifecycleController,
        keyspace: Arc<InMemoryKeyspace>,
        factory: Arc<InMemoryQueueFactory>,
        tracker: Arc<CompletionTracker>,
    }

    fn fixture(names: &[&str]) -> Fixture {
        let keyspace = Arc::new(InMemoryKeyspace::new());
        let factory = Arc::new(InMemoryQueueFactory::new());
        let registry = Arc::new(QueueRegistry::new("bull", factory.clone()));
        registry.add_queues(names.iter().copied());
        let tracker = Arc::new(CompletionTracker::new(registry.clone(), Arc::new(NullSink)));
        let lifecycle = LifecycleController::new(keyspace.clone(), registry, tracker.clone());
        Fixture {
            lifecycle,
            keyspace,
            factory,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_ping() {
        let f = fixture(&[]);
        assert!(f.lifecycle.ping().await.is_ok());

        f.keyspace.set_reachable(false);
        assert_matches!(f.lifecycle.ping().await, Err(Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_close_tears_everything_down() {
        let f = fixture(&["a", "b"]);
        f.tracker.enable().await;

        f.lifecycle.close().await.unwrap();

        assert!(!f.keyspace.is_connected());
        for name in ["a", "b"] {
            let q = f.factory.queue(name).unwrap();
            assert_eq!(q.listener_count(), 0);
            assert!(q.is_closed());
        }
        assert!(f.tracker.tracked_queues().is_empty());
    }

    #[tokio::test]
    async fn test_second_close_is_ok() {
        let f = fixture(&["a"]);
        f.lifecycle.close().await.unwrap();
        f.lifecycle.close().await.unwrap();
        assert!(f.lifecycle.is_closed());
    }

    #[tokio::test]
    async fn test_close_failure_does_not_abort_others() {
        let f = fixture(&["a", "b", "c"]);
        f.factory.queue("b").unwrap().fail_close(true);

        assert_matches!(f.lifecycle.close().await, Err(Error::Connection(_)));

        for name in ["a", "b", "c"] {
            assert!(f.factory.queue(name).unwrap().is_closed());
        }
        assert!(f.lifecycle.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_late_registration_after_close_is_refused() {
        let f = fixture(&["a"]);
        f.lifecycle.close().await.unwrap();

        assert!(f.lifecycle.registry.add_queues(["late"]).is_empty());
        assert_eq!(f.tracker.enable().await, 0);
        assert!(f.factory.queue("late").is_none());
        assert_eq!(f.factory.queue("a").unwrap().listener_count(), 0);

        f.lifecycle.close().await.unwrap();
        assert!(f.tracker.tracked_queues().is_empty());
    }

    #[tokio::test]
    async fn test_ping_after_close_fails() {
        let f = fixture(&[]);
        f.lifecycle.close().await.unwrap();
        assert_matches!(f.lifecycle.ping().await, Err(Error::Connection(_)));
    }
}
