//! In-Memory Adapters
//!
//! Keyspace and queue implementations that keep everything in process.
//! Used by the test-suite and for dry runs without a Redis server.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use crate::domain::ports::{
    CompletionListener, JobCounts, JobRecord, KeyScan, KeyspaceClient, QueueFactory, QueueHandle,
    SubscriptionToken,
};
use crate::error::{Error, Result};

/// Translate a Redis glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => {
                if let Some(escaped) = chars.next() {
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// =============================================================================
// Keyspace
// =============================================================================

/// In-memory keyspace with chunked scanning.
#[derive(Debug)]
pub struct InMemoryKeyspace {
    keys: RwLock<BTreeSet<String>>,
    chunk_size: usize,
    connected: AtomicBool,
    reachable: AtomicBool,
    scans: AtomicUsize,
}

impl Default for InMemoryKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKeyspace {
    pub fn new() -> Self {
        Self::with_chunk_size(10)
    }

    /// Keys per scan chunk.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            keys: RwLock::new(BTreeSet::new()),
            chunk_size: chunk_size.max(1),
            connected: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            scans: AtomicUsize::new(0),
        }
    }

    /// Create a key.
    pub fn insert(&self, key: impl Into<String>) {
        self.keys.write().insert(key.into());
    }

    /// Delete a key.
    pub fn remove(&self, key: &str) -> bool {
        self.keys.write().remove(key)
    }

    /// Simulate the server going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Number of scans started.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Connection("connection closed".into()));
        }
        if !self.reachable.load(Ordering::Acquire) {
            return Err(Error::Connection("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyspaceClient for InMemoryKeyspace {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    fn scan_match(&self, pattern: &str) -> KeyScan {
        self.scans.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.check() {
            return stream::iter(vec![Err(e)]).boxed();
        }

        let Some(matcher) = glob_to_regex(pattern) else {
            return stream::empty().boxed();
        };
        let matching: Vec<String> = self
            .keys
            .read()
            .iter()
            .filter(|k| matcher.is_match(k))
            .cloned()
            .collect();

        let chunks: Vec<Result<Vec<String>>> = matching
            .chunks(self.chunk_size)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();

        stream::iter(chunks).boxed()
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

// =============================================================================
// Queue
// =============================================================================

/// In-memory queue with scriptable failures.
pub struct InMemoryQueue {
    name: String,
    prefix: String,
    counts: Mutex<JobCounts>,
    jobs: Mutex<HashMap<String, JobRecord>>,
    broken_jobs: Mutex<HashSet<String>>,
    listeners: Mutex<HashMap<SubscriptionToken, CompletionListener>>,
    counts_delay: Mutex<Option<Duration>>,
    fail_counts: AtomicBool,
    fail_close: AtomicBool,
    count_calls: AtomicUsize,
    closed: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(name: &str, prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            counts: Mutex::new(JobCounts::default()),
            jobs: Mutex::new(HashMap::new()),
            broken_jobs: Mutex::new(HashSet::new()),
            listeners: Mutex::new(HashMap::new()),
            counts_delay: Mutex::new(None),
            fail_counts: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            count_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the job counts.
    pub fn set_counts(&self, counts: JobCounts) {
        *self.counts.lock() = counts;
    }

    /// Store a job record.
    pub fn insert_job(&self, job: JobRecord) {
        self.jobs.lock().insert(job.id.clone(), job);
    }

    /// Make fetching `id` fail.
    pub fn break_job(&self, id: &str) {
        self.broken_jobs.lock().insert(id.to_string());
    }

    /// Make `job_counts` fail.
    pub fn fail_counts(&self, fail: bool) {
        self.fail_counts.store(fail, Ordering::Release);
    }

    /// Make `close` fail.
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::Release);
    }

    /// Delay every `job_counts` call.
    pub fn delay_counts(&self, delay: Duration) {
        *self.counts_delay.lock() = Some(delay);
    }

    /// Number of `job_counts` calls made.
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::Relaxed)
    }

    /// Deliver a completion event to every listener. Returns the number of
    /// listeners reached.
    pub fn emit_completed(&self, job_id: &str) -> usize {
        let targets: Vec<CompletionListener> = self.listeners.lock().values().cloned().collect();
        targets
            .iter()
            .filter(|listener| listener.send(job_id.to_string()).is_ok())
            .count()
    }
}

#[async_trait]
impl QueueHandle for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        self.count_calls.fetch_add(1, Ordering::Relaxed);

        let delay = *self.counts_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }
        if self.fail_counts.load(Ordering::Acquire) {
            return Err(Error::Connection(format!("counts unavailable for {}", self.name)));
        }
        Ok(*self.counts.lock())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }
        if self.broken_jobs.lock().contains(id) {
            return Err(Error::JobFetch {
                job_id: id.to_string(),
                reason: "simulated fetch failure".into(),
            });
        }
        Ok(self.jobs.lock().get(id).cloned())
    }

    fn on_completed(&self, listener: CompletionListener) -> Result<SubscriptionToken> {
        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }
        let token = SubscriptionToken::new();
        self.listeners.lock().insert(token, listener);
        Ok(token)
    }

    fn remove_listener(&self, token: &SubscriptionToken) -> bool {
        self.listeners.lock().remove(token).is_some()
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.listeners.lock().clear();
        if self.fail_close.load(Ordering::Acquire) {
            return Err(Error::Connection(format!("failed to close {}", self.name)));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("listeners", &self.listener_count())
            .finish()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Hands out [`InMemoryQueue`]s and remembers them for inspection.
#[derive(Debug, Default)]
pub struct InMemoryQueueFactory {
    queues: DashMap<String, Arc<InMemoryQueue>>,
    opened: AtomicUsize,
}

impl InMemoryQueueFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue previously opened (or seeded) under `name`.
    pub fn queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues.get(name).map(|q| q.value().clone())
    }

    /// Pre-create a queue so tests can configure it before it is opened.
    pub fn seed(&self, name: &str, prefix: &str) -> Arc<InMemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryQueue::new(name, prefix)))
            .value()
            .clone()
    }

    /// Number of `open` calls.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }
}

impl QueueFactory for InMemoryQueueFactory {
    fn open(&self, name: &str, prefix: &str) -> Arc<dyn QueueHandle> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.seed(name, prefix)
    }
}
