//! Metrics module
//!
//! Prometheus exposition of queue statistics.

mod gauges;

pub use gauges::{encode_text, text_content_type, QueueGauges, LABELS};
