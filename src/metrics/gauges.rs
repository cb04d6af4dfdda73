//! Queue Gauges
//!
//! Prometheus gauges for queue depth and a histogram of job processing time.

use async_trait::async_trait;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::domain::ports::{CompletionStats, GaugeSink, JobCounts, JobRecord, QueueHandle};
use crate::error::{Error, Result};

/// Label names, in the order values are passed.
pub const LABELS: [&str; 2] = ["queue", "prefix"];

/// Buckets for `complete_duration`, in milliseconds.
const DURATION_BUCKETS_MS: [f64; 14] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1_000.0, 2_500.0, 5_000.0, 10_000.0, 30_000.0,
    60_000.0, 300_000.0,
];

/// Gauge family for every observed queue.
#[derive(Clone)]
pub struct QueueGauges {
    pub completed: IntGaugeVec,
    pub active: IntGaugeVec,
    pub delayed: IntGaugeVec,
    pub failed: IntGaugeVec,
    pub waiting: IntGaugeVec,
    pub paused: IntGaugeVec,
    pub complete_duration: HistogramVec,
}

impl QueueGauges {
    /// Create the gauge family and register it in every given registry.
    ///
    /// Fails if a metric with the same name is already registered.
    pub fn new(metric_prefix: &str, registries: &[Registry]) -> Result<Self> {
        let gauge = |name: &str, help: &str| {
            IntGaugeVec::new(Opts::new(format!("{}{}", metric_prefix, name), help), &LABELS)
        };

        let gauges = Self {
            completed: gauge("completed", "Number of completed jobs")?,
            active: gauge("active", "Number of active jobs")?,
            delayed: gauge("delayed", "Number of delayed jobs")?,
            failed: gauge("failed", "Number of failed jobs")?,
            waiting: gauge("waiting", "Number of waiting jobs")?,
            paused: gauge("paused", "Number of paused jobs")?,
            complete_duration: HistogramVec::new(
                HistogramOpts::new(
                    format!("{}complete_duration", metric_prefix),
                    "Time to complete jobs, in milliseconds",
                )
                .buckets(DURATION_BUCKETS_MS.to_vec()),
                &LABELS,
            )?,
        };

        for registry in registries {
            gauges.register(registry)?;
        }
        Ok(gauges)
    }

    fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.completed.clone()))?;
        registry.register(Box::new(self.active.clone()))?;
        registry.register(Box::new(self.delayed.clone()))?;
        registry.register(Box::new(self.failed.clone()))?;
        registry.register(Box::new(self.waiting.clone()))?;
        registry.register(Box::new(self.paused.clone()))?;
        registry.register(Box::new(self.complete_duration.clone()))?;
        Ok(())
    }

    /// Publish counts for one queue.
    pub fn set_counts(&self, prefix: &str, name: &str, counts: &JobCounts) {
        let labels = [name, prefix];
        self.completed.with_label_values(&labels).set(clamp(counts.completed));
        self.active.with_label_values(&labels).set(clamp(counts.active));
        self.delayed.with_label_values(&labels).set(clamp(counts.delayed));
        self.failed.with_label_values(&labels).set(clamp(counts.failed));
        self.waiting.with_label_values(&labels).set(clamp(counts.waiting));
        self.paused.with_label_values(&labels).set(clamp(counts.paused));
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl GaugeSink for QueueGauges {
    async fn update_stats(
        &self,
        prefix: &str,
        name: &str,
        queue: &dyn QueueHandle,
    ) -> Result<JobCounts> {
        let counts = queue.job_counts().await?;
        self.set_counts(prefix, name, &counts);
        Ok(counts)
    }

    fn record_completion(
        &self,
        prefix: &str,
        name: &str,
        _job: &JobRecord,
        stats: &CompletionStats,
    ) -> Result<()> {
        self.complete_duration
            .with_label_values(&[name, prefix])
            .observe(stats.duration.as_secs_f64() * 1_000.0);
        Ok(())
    }
}

impl std::fmt::Debug for QueueGauges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueGauges").finish_non_exhaustive()
    }
}

/// Encode a registry in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics are not utf-8: {}", e)))
}

/// Content type of [`encode_text`] output.
pub fn text_content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
