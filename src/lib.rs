//! Bull Exporter
//!
//! Prometheus metrics for Bull job queues stored in Redis.
//!
//! # Architecture
//!
//! ```text
//! Redis ──▶ MetricCollector ──▶ QueueGauges ──▶ /metrics
//!             │
//!             ├─ discovery (SCAN for queue keys)
//!             ├─ stats refresh (per-state counts)
//!             └─ completion tracking (pubsub + job lookup)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Redis and in-memory implementations of the ports
//! - [`collector`] - Queue registry, discovery, stats, completion tracking
//! - [`config`] - Collector and connection options
//! - [`connection`] - Redis connection management and TLS policy
//! - [`domain`] - Ports and value objects
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus gauges and text encoding

pub mod adapters;
pub mod collector;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use collector::{DiscoveryReport, MetricCollector, RefreshSummary};
pub use config::{CollectorOptions, ConnectionOptions};
pub use error::{Error, Result};
pub use metrics::QueueGauges;
