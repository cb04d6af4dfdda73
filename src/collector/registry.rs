//! Queue Registry
//!
//! The set of known queues, each bound to a backend handle. Grows
//! monotonically until sealed at shutdown; there is no removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::ports::{QueueFactory, QueueHandle};

/// A registered queue.
#[derive(Clone)]
pub struct QueueEntry {
    /// Queue name, unique within the registry
    pub name: String,

    /// Key prefix the queue lives under
    pub prefix: String,

    /// Backend handle bound to (name, prefix)
    pub queue: Arc<dyn QueueHandle>,
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Idempotent name → queue mapping.
pub struct QueueRegistry {
    prefix: String,
    factory: Arc<dyn QueueFactory>,
    entries: RwLock<HashMap<String, QueueEntry>>,
    sealed: AtomicBool,
}

impl QueueRegistry {
    pub fn new(prefix: impl Into<String>, factory: Arc<dyn QueueFactory>) -> Self {
        Self {
            prefix: prefix.into(),
            factory,
            entries: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        }
    }

    /// Key prefix applied to every queue registered here.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register every name not already present. Returns the names added.
    ///
    /// Once sealed, nothing is registered.
    pub fn add_queues<I, S>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        let mut entries = self.entries.write();

        if self.is_sealed() {
            let late: Vec<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
            debug!(queues = ?late, "registry sealed; ignoring queues");
            return added;
        }

        for name in names {
            let name = name.as_ref();
            if name.is_empty() || entries.contains_key(name) {
                continue;
            }

            let queue = self.factory.open(name, &self.prefix);
            entries.insert(
                name.to_string(),
                QueueEntry {
                    name: name.to_string(),
                    prefix: self.prefix.clone(),
                    queue,
                },
            );

            info!(queue = %name, prefix = %self.prefix, "added queue");
            added.push(name.to_string());
        }

        added
    }

    /// Refuse further registrations.
    ///
    /// Waits for any registration in progress, so a `list()` taken afterwards
    /// is final.
    pub fn seal(&self) {
        let _entries = self.entries.write();
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Snapshot of the current entries.
    pub fn list(&self) -> Vec<QueueEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Sorted queue names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<QueueEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("prefix", &self.prefix)
            .field("queues", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryQueueFactory;

    fn registry() -> (QueueRegistry, Arc<InMemoryQueueFactory>) {
        let factory = Arc::new(InMemoryQueueFactory::new());
        (QueueRegistry::new("bull", factory.clone()), factory)
    }

    #[test]
    fn test_add_is_idempotent() {
        let (registry, factory) = registry();

        let added = registry.add_queues(["orders"]);
        assert_eq!(added, vec!["orders".to_string()]);

        let added = registry.add_queues(["orders"]);
        assert!(added.is_empty());

        assert_eq!(registry.len(), 1);
        assert_eq!(factory.opened(), 1);
    }

    #[test]
    fn test_duplicates_within_one_call() {
        let (registry, factory) = registry();

        let added = registry.add_queues(vec!["a".to_string(), "b".to_string(), "a".to_string()]);

        assert_eq!(added.len(), 2);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(factory.opened(), 2);
    }

    #[test]
    fn test_empty_names_are_skipped() {
        let (registry, _) = registry();
        assert!(registry.add_queues([""]).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_entries_bound_to_prefix() {
        let (registry, _) = registry();
        registry.add_queues(["orders"]);

        let entry = registry.get("orders").unwrap();
        assert_eq!(entry.prefix, "bull");
        assert_eq!(entry.queue.name(), "orders");
        assert_eq!(entry.queue.prefix(), "bull");
        assert!(registry.contains("orders"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_list_is_snapshot() {
        let (registry, _) = registry();
        registry.add_queues(["a"]);

        let snapshot = registry.list();
        registry.add_queues(["b"]);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_sealed_registry_refuses_queues() {
        let (registry, factory) = registry();
        registry.add_queues(["a"]);

        registry.seal();

        assert!(registry.is_sealed());
        assert!(registry.add_queues(["late"]).is_empty());
        assert_eq!(registry.names(), vec!["a"]);
        assert_eq!(factory.opened(), 1);
    }
}
