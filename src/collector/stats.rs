//! Stats Refresher
//!
//! Refreshes depth gauges for every registered queue in one concurrent
//! fan-out. A failing queue never cancels or delays the others.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use super::registry::QueueRegistry;
use crate::domain::ports::GaugeSink;

/// Result of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Queues whose gauges were updated
    pub refreshed: usize,
    /// Queues whose fetch failed; their gauges keep the previous value
    pub failed: Vec<String>,
}

impl RefreshSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct StatsRefresher {
    registry: Arc<QueueRegistry>,
    sink: Arc<dyn GaugeSink>,
}

impl StatsRefresher {
    pub fn new(registry: Arc<QueueRegistry>, sink: Arc<dyn GaugeSink>) -> Self {
        Self { registry, sink }
    }

    /// Fetch stats for every registered queue concurrently and wait for all
    /// of them to settle.
    pub async fn update_all(&self) -> RefreshSummary {
        let entries = self.registry.list();

        let results = join_all(entries.iter().map(|entry| async move {
            let result = self
                .sink
                .update_stats(&entry.prefix, &entry.name, entry.queue.as_ref())
                .await;
            (entry, result)
        }))
        .await;

        let mut summary = RefreshSummary::default();
        for (entry, result) in results {
            match result {
                Ok(counts) => {
                    debug!(queue = %entry.name, prefix = %entry.prefix, ?counts, "refreshed queue stats");
                    summary.refreshed += 1;
                }
                Err(e) => {
                    warn!(queue = %entry.name, prefix = %entry.prefix, unreachable = e.is_connection(), error = %e, "failed to refresh queue stats");
                    summary.failed.push(entry.name.clone());
                }
            }
        }

        summary.failed.sort();
        summary
    }
}

impl std::fmt::Debug for StatsRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRefresher")
            .field("queues", &self.registry.len())
            .finish()
    }
}
