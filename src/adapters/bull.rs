//! Bull Queue Adapter
//!
//! Implements the `QueueHandle` port on top of Bull's Redis layout:
//!
//! ```text
//! <prefix>:<queue>:wait|active|paused      lists
//! <prefix>:<queue>:completed|failed|delayed sorted sets
//! <prefix>:<queue>:<jobId>                  job hash
//! <prefix>:<queue>:completed                pub/sub channel for completions
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionKind, ConnectionManager, StoreConnection};
use crate::domain::ports::{
    CompletionListener, JobCounts, JobRecord, QueueFactory, QueueHandle, SubscriptionToken,
};
use crate::error::{Error, Result};

/// Delay before re-subscribing after the completion channel drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

type ListenerMap = Arc<Mutex<HashMap<SubscriptionToken, CompletionListener>>>;

// =============================================================================
// Factory
// =============================================================================

/// Opens [`BullQueue`] handles that draw connections from a shared manager.
#[derive(Clone)]
pub struct BullQueueFactory {
    connections: Arc<ConnectionManager>,
}

impl BullQueueFactory {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }
}

impl QueueFactory for BullQueueFactory {
    fn open(&self, name: &str, prefix: &str) -> Arc<dyn QueueHandle> {
        Arc::new(BullQueue::new(name, prefix, self.connections.clone()))
    }
}

impl std::fmt::Debug for BullQueueFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BullQueueFactory")
            .field("connections", &self.connections)
            .finish()
    }
}

// =============================================================================
// Queue Handle
// =============================================================================

/// Handle onto one Bull queue.
pub struct BullQueue {
    name: String,
    prefix: String,
    connections: Arc<ConnectionManager>,
    listeners: ListenerMap,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BullQueue {
    pub fn new(name: &str, prefix: &str, connections: Arc<ConnectionManager>) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            connections,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Full Redis key for a queue-relative suffix.
    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.name, suffix)
    }

    fn ensure_pump(&self) -> Result<()> {
        let mut pump = self.pump.lock();
        if pump.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("completion listener needs a runtime: {}", e)))?;

        let conn = self.connections.connection(ConnectionKind::Subscribe);
        let channel = self.key("completed");
        let queue = self.name.clone();
        let listeners = self.listeners.clone();

        *pump = Some(runtime.spawn(pump_completions(conn, channel, queue, listeners)));
        Ok(())
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl QueueHandle for BullQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }

        let mut conn = self
            .connections
            .connection(ConnectionKind::Basic)
            .multiplexed()
            .await?;

        let (waiting, active, paused, completed, failed, delayed): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.key("wait"))
                .llen(self.key("active"))
                .llen(self.key("paused"))
                .zcard(self.key("completed"))
                .zcard(self.key("failed"))
                .zcard(self.key("delayed"))
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }

        let mut conn = self
            .connections
            .connection(ConnectionKind::Basic)
            .multiplexed()
            .await?;

        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::JobFetch {
                job_id: id.to_string(),
                reason: e.to_string(),
            })?;

        parse_job_hash(id, &fields)
    }

    fn on_completed(&self, listener: CompletionListener) -> Result<SubscriptionToken> {
        if self.is_closed() {
            return Err(Error::QueueClosed(self.name.clone()));
        }

        let token = SubscriptionToken::new();
        self.listeners.lock().insert(token, listener);

        if let Err(e) = self.ensure_pump() {
            self.listeners.lock().remove(&token);
            return Err(e);
        }

        debug!(queue = %self.name, token = %token, "completion listener added");
        Ok(token)
    }

    fn remove_listener(&self, token: &SubscriptionToken) -> bool {
        let (removed, now_empty) = {
            let mut listeners = self.listeners.lock();
            let removed = listeners.remove(token).is_some();
            (removed, listeners.is_empty())
        };

        if now_empty {
            self.stop_pump();
        }
        removed
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.listeners.lock().clear();
        self.stop_pump();

        info!(queue = %self.name, prefix = %self.prefix, "closed queue");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BullQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BullQueue")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("listeners", &self.listener_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Completion Pump
// =============================================================================

/// Forward completion messages from `channel` to every registered listener.
///
/// Owns its dedicated subscribe connection; re-subscribes after the channel
/// drops for as long as listeners remain.
async fn pump_completions(
    conn: StoreConnection,
    channel: String,
    queue: String,
    listeners: ListenerMap,
) {
    loop {
        match conn.subscribe(&channel).await {
            Ok(mut pubsub) => {
                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(queue = %queue, error = %e, "unreadable completion message");
                            continue;
                        }
                    };

                    let Some(job_id) = completed_job_id(&payload) else {
                        warn!(queue = %queue, payload = %payload, "completion message without job id");
                        continue;
                    };

                    let targets: Vec<CompletionListener> =
                        listeners.lock().values().cloned().collect();
                    for listener in targets {
                        let _ = listener.send(job_id.clone());
                    }
                }
                warn!(queue = %queue, channel = %channel, "completion channel closed");
            }
            Err(e) => {
                warn!(queue = %queue, channel = %channel, error = %e, "failed to subscribe to completions");
            }
        }

        if listeners.lock().is_empty() {
            return;
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

#[derive(Debug, Deserialize)]
struct CompletedMessage {
    #[serde(rename = "jobId")]
    job_id: serde_json::Value,
}

/// Extract the job id from a completion payload.
///
/// Bull publishes `{"jobId": ..., "val": ...}`; older releases published the
/// bare id, sometimes JSON-quoted.
pub fn completed_job_id(payload: &str) -> Option<String> {
    match serde_json::from_str::<CompletedMessage>(payload) {
        Ok(msg) => match msg.job_id {
            serde_json::Value::String(id) if !id.is_empty() => Some(id),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        },
        Err(_) => {
            if let Ok(id) = serde_json::from_str::<String>(payload) {
                return (!id.is_empty()).then_some(id);
            }
            let trimmed = payload.trim();
            (!trimmed.is_empty() && !trimmed.starts_with('{')).then(|| trimmed.to_string())
        }
    }
}

// =============================================================================
// Job Hash Parsing
// =============================================================================

fn parse_millis(job_id: &str, field: &str, value: Option<&String>) -> Result<Option<i64>> {
    let Some(raw) = value.map(|v| v.trim()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    raw.parse::<i64>()
        .or_else(|_| raw.parse::<f64>().map(|f| f as i64))
        .map(Some)
        .map_err(|_| Error::JobFetch {
            job_id: job_id.to_string(),
            reason: format!("invalid {} value: {}", field, raw),
        })
}

/// Decode a Bull job hash. An empty hash means the job does not exist.
pub fn parse_job_hash(id: &str, fields: &HashMap<String, String>) -> Result<Option<JobRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let mut job = JobRecord::new(id);
    job.name = fields.get("name").cloned();
    job.failed_reason = fields.get("failedReason").filter(|r| !r.is_empty()).cloned();
    job.return_value = fields.get("returnvalue").cloned();
    job.attempts_made = fields
        .get("attemptsMade")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if let Some(ms) = parse_millis(id, "timestamp", fields.get("timestamp"))? {
        job = job.with_created_ms(ms);
    }
    if let Some(ms) = parse_millis(id, "processedOn", fields.get("processedOn"))? {
        job = job.with_processed_ms(ms);
    }
    if let Some(ms) = parse_millis(id, "finishedOn", fields.get("finishedOn"))? {
        job = job.with_finished_ms(ms);
    }

    Ok(Some(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionOptions;
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;

    fn queue(name: &str) -> BullQueue {
        let manager = ConnectionManager::new(&ConnectionOptions::default()).unwrap();
        BullQueue::new(name, "bull", Arc::new(manager))
    }

    fn hash(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_layout() {
        let q = queue("orders");
        assert_eq!(q.key("wait"), "bull:orders:wait");
        assert_eq!(q.key("42"), "bull:orders:42");
        assert_eq!(q.name(), "orders");
        assert_eq!(q.prefix(), "bull");
    }

    #[test]
    fn test_parse_empty_hash_is_missing() {
        assert_eq!(parse_job_hash("1", &HashMap::new()).unwrap(), None);
    }

    #[test]
    fn test_parse_job_hash() {
        let fields = hash(&[
            ("name", "__default__"),
            ("timestamp", "1700000000000"),
            ("processedOn", "1700000000500"),
            ("finishedOn", "1700000001500"),
            ("attemptsMade", "2"),
            ("failedReason", "boom"),
            ("returnvalue", "{\"ok\":true}"),
        ]);

        let job = parse_job_hash("9", &fields).unwrap().unwrap();
        assert_eq!(job.id, "9");
        assert_eq!(job.name.as_deref(), Some("__default__"));
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));

        let stats = job.completion_stats().unwrap().unwrap();
        assert_eq!(stats.duration, Duration::from_millis(1000));
        assert_eq!(stats.wait, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_parse_job_hash_bad_timestamp() {
        let fields = hash(&[("processedOn", "yesterday")]);
        assert_matches!(parse_job_hash("3", &fields), Err(Error::JobFetch { job_id, .. }) if job_id == "3");
    }

    #[test]
    fn test_completed_job_id_formats() {
        assert_eq!(
            completed_job_id(r#"{"jobId":"17","val":null}"#).as_deref(),
            Some("17")
        );
        assert_eq!(completed_job_id(r#"{"jobId":18}"#).as_deref(), Some("18"));
        assert_eq!(completed_job_id("19").as_deref(), Some("19"));
        assert_eq!(completed_job_id(r#"{"val":1}"#), None);
        assert_eq!(completed_job_id(""), None);
        assert_eq!(completed_job_id(r#""17""#).as_deref(), Some("17"));
        assert_eq!(completed_job_id(r#""""#), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_listeners() {
        let q = queue("orders");

        q.close().await.unwrap();
        q.close().await.unwrap();
        assert!(q.is_closed());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert_matches!(q.on_completed(tx), Err(Error::QueueClosed(name)) if name == "orders");
        assert_matches!(q.job_counts().await, Err(Error::QueueClosed(_)));
    }

    #[tokio::test]
    async fn test_listener_tokens() {
        let q = queue("orders");
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = q.on_completed(tx.clone()).unwrap();
        let b = q.on_completed(tx).unwrap();
        assert_eq!(q.listener_count(), 2);

        assert!(q.remove_listener(&a));
        assert!(!q.remove_listener(&a));
        assert_eq!(q.listener_count(), 1);

        q.close().await.unwrap();
        assert_eq!(q.listener_count(), 0);
        assert!(!q.remove_listener(&b));
    }
}
