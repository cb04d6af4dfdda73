//! Queue Discovery
//!
//! Finds queues that exist in Redis but were never configured, by scanning
//! for `<prefix>:<queue>:<suffix>` keys whose suffix marks a queue's
//! existence. Other per-queue suffixes are ignored.

use std::sync::Arc;

use futures::TryStreamExt;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::registry::QueueRegistry;
use crate::domain::ports::KeyspaceClient;
use crate::error::{Error, Result};

/// Key suffixes that identify a queue.
pub const IDENTITY_SUFFIXES: [&str; 5] = ["id", "failed", "active", "waiting", "stalled-check"];

/// Outcome of one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Keys returned by the scan
    pub scanned: usize,
    /// Keys that matched an identity suffix
    pub matched: usize,
    /// Queue names newly registered
    pub added: Vec<String>,
}

/// Scans the keyspace and registers the queues it finds.
pub struct DiscoveryEngine {
    client: Arc<dyn KeyspaceClient>,
    registry: Arc<QueueRegistry>,
    glob: String,
    matcher: Regex,
}

impl DiscoveryEngine {
    pub fn new(client: Arc<dyn KeyspaceClient>, registry: Arc<QueueRegistry>) -> Result<Self> {
        let prefix = registry.prefix().to_string();
        let glob = format!("{}:*:*", escape_glob(&prefix));
        let matcher = Regex::new(&format!(
            "^{}:([^:]+):({})$",
            regex::escape(&prefix),
            IDENTITY_SUFFIXES.join("|")
        ))
        .map_err(|e| Error::Internal(format!("invalid discovery pattern: {}", e)))?;

        Ok(Self {
            client,
            registry,
            glob,
            matcher,
        })
    }

    /// Loose glob handed to the keyspace scan.
    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Strict pattern used to validate each scanned key.
    pub fn pattern(&self) -> &str {
        self.matcher.as_str()
    }

    /// Queue name encoded in `key`, if the key marks a queue's existence.
    pub fn queue_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        self.matcher
            .captures(key)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Run one full scan.
    ///
    /// Every run starts a fresh enumeration. Keys created or removed while
    /// the scan is in progress may or may not be seen; the next run picks
    /// them up.
    #[instrument(skip(self), fields(pattern = %self.pattern()))]
    pub async fn run(&self) -> Result<DiscoveryReport> {
        info!("running queue discovery");

        let mut report = DiscoveryReport::default();
        let mut chunks = self.client.scan_match(&self.glob);

        while let Some(chunk) = chunks.try_next().await? {
            report.scanned += chunk.len();
            for key in &chunk {
                let Some(name) = self.queue_name(key) else {
                    continue;
                };
                report.matched += 1;
                report.added.extend(self.registry.add_queues([name]));
            }
        }

        debug!(
            scanned = report.scanned,
            matched = report.matched,
            added = report.added.len(),
            "queue discovery finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("glob", &self.glob)
            .field("pattern", &self.pattern())
            .finish()
    }
}

/// Escape Redis glob metacharacters.
fn escape_glob(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryKeyspace, InMemoryQueueFactory};
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn engine(keys: &[&str]) -> (DiscoveryEngine, Arc<QueueRegistry>, Arc<InMemoryKeyspace>) {
        let keyspace = Arc::new(InMemoryKeyspace::with_chunk_size(2));
        for key in keys {
            keyspace.insert(*key);
        }
        let registry = Arc::new(QueueRegistry::new(
            "bull",
            Arc::new(InMemoryQueueFactory::new()),
        ));
        let engine = DiscoveryEngine::new(keyspace.clone(), registry.clone()).unwrap();
        (engine, registry, keyspace)
    }

    #[test]
    fn test_patterns() {
        let (engine, _, _) = engine(&[]);
        assert_eq!(engine.glob(), "bull:*:*");
        assert_eq!(
            engine.pattern(),
            "^bull:([^:]+):(id|failed|active|waiting|stalled-check)$"
        );
    }

    #[test]
    fn test_queue_name_extraction() {
        let (engine, _, _) = engine(&[]);

        assert_eq!(engine.queue_name("bull:orders:waiting"), Some("orders"));
        assert_eq!(engine.queue_name("bull:orders:stalled-check"), Some("orders"));
        assert_eq!(engine.queue_name("bull:orders:otherSuffix"), None);
        assert_eq!(engine.queue_name("bull:orders:42"), None);
        assert_eq!(engine.queue_name("bull:a:b:id"), None);
        assert_eq!(engine.queue_name("other:orders:id"), None);
    }

    #[tokio::test]
    async fn test_discovery_ignores_other_suffixes() {
        let (engine, registry, _) = engine(&["bull:orders:waiting", "bull:orders:otherSuffix"]);

        let report = engine.run().await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.matched, 1);
        assert_eq!(report.added, vec!["orders".to_string()]);
        assert_eq!(registry.names(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_discovery_is_repeatable() {
        let (engine, registry, keyspace) = engine(&[
            "bull:orders:id",
            "bull:orders:active",
            "bull:mail:failed",
            "bull:mail:7",
        ]);

        let first = engine.run().await.unwrap();
        assert_eq!(first.added.len(), 2);

        keyspace.insert("bull:reports:stalled-check");
        let second = engine.run().await.unwrap();

        assert_eq!(second.added, vec!["reports".to_string()]);
        assert_eq!(registry.names(), vec!["mail", "orders", "reports"]);
        assert_eq!(keyspace.scan_count(), 2);
    }

    #[tokio::test]
    async fn test_discovery_surfaces_scan_failure() {
        let (engine, registry, keyspace) = engine(&["bull:orders:id"]);
        keyspace.set_reachable(false);

        assert_matches!(engine.run().await, Err(Error::Connection(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_prefix_is_escaped() {
        let registry = Arc::new(QueueRegistry::new(
            "app.v1*",
            Arc::new(InMemoryQueueFactory::new()),
        ));
        let engine = DiscoveryEngine::new(Arc::new(InMemoryKeyspace::new()), registry).unwrap();

        assert_eq!(engine.glob(), "app.v1\\*:*:*");
        assert_eq!(engine.queue_name("app.v1*:jobs:id"), Some("jobs"));
        assert_eq!(engine.queue_name("appxv1*:jobs:id"), None);
    }

    proptest! {
        #[test]
        fn prop_identity_keys_yield_queue_name(
            name in "[a-zA-Z0-9_-]{1,24}",
            suffix in prop::sample::select(IDENTITY_SUFFIXES.to_vec()),
        ) {
            let (engine, _, _) = engine(&[]);
            let key = format!("bull:{}:{}", name, suffix);
            prop_assert_eq!(engine.queue_name(&key), Some(name.as_str()));
        }

        #[test]
        fn prop_unknown_suffixes_are_ignored(
            name in "[a-z]{1,12}",
            suffix in "[a-z]{1,12}",
        ) {
            prop_assume!(!IDENTITY_SUFFIXES.contains(&suffix.as_str()));
            let (engine, _, _) = engine(&[]);
            let key = format!("bull:{}:{}", name, suffix);
            prop_assert_eq!(engine.queue_name(&key), None);
        }
    }
}
