//! Domain Ports (Port/Adapter Pattern)
//!
//! Core abstractions the collector depends on. The Redis/Bull adapters and
//! the in-memory adapters implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Collector                               │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  KeyspaceClient │ QueueHandle │ QueueFactory │ Sink │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  StoreConnection │ BullQueue │ InMemory* │ Gauges   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Job counts per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: u64,
}

/// A job as stored by the queue library.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    /// Job id, unique within its queue
    pub id: String,

    /// Job name (Bull's named processors)
    pub name: Option<String>,

    /// When the job was added
    pub created_at: Option<DateTime<Utc>>,

    /// When a worker picked the job up
    pub processed_on: Option<DateTime<Utc>>,

    /// When the job reached a final state
    pub finished_on: Option<DateTime<Utc>>,

    /// Number of attempts made so far
    pub attempts_made: u32,

    /// Last failure reason, kept even if a retry later succeeded
    pub failed_reason: Option<String>,

    /// Serialized return value
    pub return_value: Option<String>,
}

impl JobRecord {
    /// Create an empty record for the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            created_at: None,
            processed_on: None,
            finished_on: None,
            attempts_made: 0,
            failed_reason: None,
            return_value: None,
        }
    }

    /// Set processing start from epoch milliseconds.
    pub fn with_processed_ms(mut self, ms: i64) -> Self {
        self.processed_on = DateTime::from_timestamp_millis(ms);
        self
    }

    /// Set finish time from epoch milliseconds.
    pub fn with_finished_ms(mut self, ms: i64) -> Self {
        self.finished_on = DateTime::from_timestamp_millis(ms);
        self
    }

    /// Set creation time from epoch milliseconds.
    pub fn with_created_ms(mut self, ms: i64) -> Self {
        self.created_at = DateTime::from_timestamp_millis(ms);
        self
    }

    /// Compute completion statistics.
    ///
    /// Returns `Ok(None)` when the record carries no processing window (the
    /// job never ran through a worker that stamped it), and an error when the
    /// timestamps are inconsistent.
    pub fn completion_stats(&self) -> Result<Option<CompletionStats>> {
        let (Some(processed), Some(finished)) = (self.processed_on, self.finished_on) else {
            return Ok(None);
        };

        let duration = (finished - processed).to_std().map_err(|_| Error::JobFetch {
            job_id: self.id.clone(),
            reason: "finishedOn precedes processedOn".into(),
        })?;

        let wait = self
            .created_at
            .and_then(|created| (processed - created).to_std().ok());

        Ok(Some(CompletionStats {
            duration,
            wait,
            attempts: self.attempts_made,
            retried: self.failed_reason.is_some(),
        }))
    }
}

/// Statistics derived from a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionStats {
    /// Processing time (processedOn to finishedOn)
    pub duration: Duration,

    /// Time spent waiting before processing, if known
    pub wait: Option<Duration>,

    /// Attempts made
    pub attempts: u32,

    /// Completed after at least one failed attempt
    pub retried: bool,
}

/// Token identifying one completion-listener registration.
///
/// Returned by [`QueueHandle::on_completed`] and required by
/// [`QueueHandle::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

impl SubscriptionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receives the job id of every completion event on a queue.
pub type CompletionListener = mpsc::UnboundedSender<String>;

/// Chunked, finite enumeration of keys matching a pattern.
pub type KeyScan = BoxStream<'static, Result<Vec<String>>>;

// =============================================================================
// Keyspace Port
// =============================================================================

/// Port for basic commands on the shared backend connection.
#[async_trait]
pub trait KeyspaceClient: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<()>;

    /// Start a fresh chunked scan of keys matching a glob pattern.
    fn scan_match(&self, pattern: &str) -> KeyScan;

    /// Request disconnection. Best-effort, does not wait for in-flight commands.
    fn disconnect(&self);

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;
}

// =============================================================================
// Queue Port
// =============================================================================

/// Port for a handle onto one backend queue.
#[async_trait]
pub trait QueueHandle: Send + Sync {
    /// Queue name.
    fn name(&self) -> &str;

    /// Key prefix the queue lives under.
    fn prefix(&self) -> &str;

    /// Current job counts.
    async fn job_counts(&self) -> Result<JobCounts>;

    /// Fetch a job by id, `None` if it no longer exists.
    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;

    /// Register a listener for completion events.
    fn on_completed(&self, listener: CompletionListener) -> Result<SubscriptionToken>;

    /// Remove a listener. Returns false if the token was unknown.
    fn remove_listener(&self, token: &SubscriptionToken) -> bool;

    /// Number of registered completion listeners.
    fn listener_count(&self) -> usize;

    /// Close the handle and release its connections. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Whether [`close`](Self::close) has run.
    fn is_closed(&self) -> bool;
}

/// Port for constructing queue handles.
pub trait QueueFactory: Send + Sync {
    /// Bind a handle to `(name, prefix)`. Never fails; errors surface from
    /// the handle's commands.
    fn open(&self, name: &str, prefix: &str) -> Arc<dyn QueueHandle>;
}

// =============================================================================
// Gauge Sink Port
// =============================================================================

/// Port for the metric registry that receives queue statistics.
#[async_trait]
pub trait GaugeSink: Send + Sync {
    /// Fetch counts from `queue` and publish them labelled by (prefix, name).
    async fn update_stats(&self, prefix: &str, name: &str, queue: &dyn QueueHandle)
        -> Result<JobCounts>;

    /// Publish statistics for one completed job.
    fn record_completion(
        &self,
        prefix: &str,
        name: &str,
        job: &JobRecord,
        stats: &CompletionStats,
    ) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_completion_stats_duration() {
        let job = JobRecord::new("1")
            .with_created_ms(1_000)
            .with_processed_ms(1_500)
            .with_finished_ms(2_750);

        let stats = job.completion_stats().unwrap().unwrap();
        assert_eq!(stats.duration, Duration::from_millis(1_250));
        assert_eq!(stats.wait, Some(Duration::from_millis(500)));
        assert!(!stats.retried);
    }

    #[test]
    fn test_completion_stats_missing_timestamps() {
        let job = JobRecord::new("1").with_finished_ms(2_000);
        assert_eq!(job.completion_stats().unwrap(), None);

        let job = JobRecord::new("1").with_processed_ms(2_000);
        assert_eq!(job.completion_stats().unwrap(), None);
    }

    #[test]
    fn test_completion_stats_inverted_window() {
        let job = JobRecord::new("7")
            .with_processed_ms(5_000)
            .with_finished_ms(4_000);

        assert_matches!(job.completion_stats(), Err(Error::JobFetch { job_id, .. }) if job_id == "7");
    }

    #[test]
    fn test_completion_stats_retried() {
        let mut job = JobRecord::new("1")
            .with_processed_ms(0)
            .with_finished_ms(10);
        job.attempts_made = 3;
        job.failed_reason = Some("timeout".into());

        let stats = job.completion_stats().unwrap().unwrap();
        assert_eq!(stats.attempts, 3);
        assert!(stats.retried);
        assert!(stats.wait.is_none());
    }

    #[test]
    fn test_subscription_tokens_are_distinct() {
        let a = SubscriptionToken::new();
        let b = SubscriptionToken::new();
        assert_ne!(a, b);
        assert_eq!(a, a);
    }
}
