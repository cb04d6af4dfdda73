//! Completion Tracker
//!
//! Subscribes to each queue's completion events and records per-job
//! outcome metrics. Handlers return a `Result`; logging happens in one place
//! so a bad event is reported and dropped without affecting later ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::registry::{QueueEntry, QueueRegistry};
use crate::domain::ports::{CompletionStats, GaugeSink, SubscriptionToken};
use crate::error::{Error, Result};

/// What happened to one completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Statistics were forwarded to the gauges
    Recorded(CompletionStats),
    /// The job carried no processing window; nothing to record
    Skipped,
}

/// Counters over every event handled so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub recorded: u64,
    pub skipped: u64,
    pub missing: u64,
    pub failed: u64,
}

impl TrackerStats {
    pub fn total(&self) -> u64 {
        self.recorded + self.skipped + self.missing + self.failed
    }
}

#[derive(Debug, Default)]
struct TrackerCounters {
    recorded: AtomicU64,
    skipped: AtomicU64,
    missing: AtomicU64,
    failed: AtomicU64,
}

impl TrackerCounters {
    fn snapshot(&self) -> TrackerStats {
        TrackerStats {
            recorded: self.recorded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    token: SubscriptionToken,
    entry: QueueEntry,
    consumer: JoinHandle<()>,
}

/// Fetch the completed job and forward its statistics.
pub async fn process_completion(
    sink: &dyn GaugeSink,
    entry: &QueueEntry,
    job_id: &str,
) -> Result<CompletionOutcome> {
    let job = entry
        .queue
        .get_job(job_id)
        .await?
        .ok_or_else(|| Error::JobNotFound {
            queue: entry.name.clone(),
            job_id: job_id.to_string(),
        })?;

    let Some(stats) = job.completion_stats()? else {
        return Ok(CompletionOutcome::Skipped);
    };

    sink.record_completion(&entry.prefix, &entry.name, &job, &stats)?;
    Ok(CompletionOutcome::Recorded(stats))
}

#[derive(Clone)]
struct CompletionHandler {
    entry: QueueEntry,
    sink: Arc<dyn GaugeSink>,
    counters: Arc<TrackerCounters>,
}

impl CompletionHandler {
    async fn dispatch(self, job_id: String) {
        let result = process_completion(self.sink.as_ref(), &self.entry, &job_id).await;
        self.report(&job_id, result);
    }

    fn report(&self, job_id: &str, result: Result<CompletionOutcome>) {
        let queue = &self.entry.name;
        match result {
            Ok(CompletionOutcome::Recorded(stats)) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %queue, job = %job_id, duration_ms = stats.duration.as_millis() as u64, "recorded job completion");
            }
            Ok(CompletionOutcome::Skipped) => {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %queue, job = %job_id, "completed job has no processing window");
            }
            Err(Error::JobNotFound { .. }) => {
                self.counters.missing.fetch_add(1, Ordering::Relaxed);
                warn!(queue = %queue, job = %job_id, "unable to find job from id");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(queue = %queue, job = %job_id, error = %e, "unable to fetch completed job");
            }
        }
    }
}

/// Tracks job completions for registered queues.
pub struct CompletionTracker {
    registry: Arc<QueueRegistry>,
    sink: Arc<dyn GaugeSink>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    counters: Arc<TrackerCounters>,
    disabled: AtomicBool,
}

impl CompletionTracker {
    pub fn new(registry: Arc<QueueRegistry>, sink: Arc<dyn GaugeSink>) -> Self {
        Self {
            registry,
            sink,
            subscriptions: Mutex::new(HashMap::new()),
            counters: Arc::new(TrackerCounters::default()),
            disabled: AtomicBool::new(false),
        }
    }

    /// Subscribe to completions on every registered queue not yet tracked.
    ///
    /// Safe to call repeatedly: each queue gets at most one subscription.
    /// Returns the number of queues newly subscribed, always 0 after
    /// [`disable`](Self::disable). Must run inside a tokio runtime.
    pub async fn enable(&self) -> usize {
        let entries = self.registry.list();
        let mut subscriptions = self.subscriptions.lock();
        if self.is_disabled() {
            debug!("completion tracking disabled; not subscribing");
            return 0;
        }
        let mut enabled = 0;

        for entry in entries {
            if subscriptions.contains_key(&entry.name) {
                continue;
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let token = match entry.queue.on_completed(tx) {
                Ok(token) => token,
                Err(e) => {
                    warn!(queue = %entry.name, error = %e, "failed to subscribe to completions");
                    continue;
                }
            };

            let handler = CompletionHandler {
                entry: entry.clone(),
                sink: self.sink.clone(),
                counters: self.counters.clone(),
            };
            let consumer = tokio::spawn(consume_completions(rx, handler));

            debug!(queue = %entry.name, token = %token, "tracking job completions");
            subscriptions.insert(
                entry.name.clone(),
                Subscription {
                    token,
                    entry,
                    consumer,
                },
            );
            enabled += 1;
        }

        if enabled > 0 {
            info!(queues = enabled, "enabled completion tracking");
        }
        enabled
    }

    /// Remove every tracked subscription and refuse new ones. Returns how
    /// many were removed.
    pub fn disable(&self) -> usize {
        let drained: Vec<Subscription> = {
            let mut subscriptions = self.subscriptions.lock();
            self.disabled.store(true, Ordering::Release);
            subscriptions.drain().map(|(_, sub)| sub).collect()
        };

        for sub in &drained {
            if !sub.entry.queue.remove_listener(&sub.token) {
                debug!(queue = %sub.entry.name, token = %sub.token, "listener already gone");
            }
            sub.consumer.abort();
        }
        drained.len()
    }

    /// Handle one completion event for `entry` without logging.
    pub async fn handle_completion(
        &self,
        entry: &QueueEntry,
        job_id: &str,
    ) -> Result<CompletionOutcome> {
        process_completion(self.sink.as_ref(), entry, job_id).await
    }

    /// Names of the queues currently tracked, sorted.
    pub fn tracked_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn is_tracking(&self, name: &str) -> bool {
        self.subscriptions.lock().contains_key(name)
    }

    pub fn stats(&self) -> TrackerStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for CompletionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTracker")
            .field("tracked", &self.tracked_queues())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Spawn a handler per event so one slow fetch never holds up the next.
async fn consume_completions(mut rx: mpsc::UnboundedReceiver<String>, handler: CompletionHandler) {
    while let Some(job_id) = rx.recv().await {
        tokio::spawn(handler.clone().dispatch(job_id));
    }
}
