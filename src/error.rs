//! Error types for the Bull exporter

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while collecting queue metrics
#[derive(Error, Debug)]
pub enum Error {
    /// Backend unreachable or connection already torn down
    #[error("Backend connection error: {0}")]
    Connection(String),

    /// Redis command error
    #[error("Redis command failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Completed job id no longer present in the backend
    #[error("Job {job_id} not found in queue {queue}")]
    JobNotFound { queue: String, job_id: String },

    /// Fetching or decoding a job record failed
    #[error("Failed to fetch job {job_id}: {reason}")]
    JobFetch { job_id: String, reason: String },

    /// Operation on a queue handle that was already closed
    #[error("Queue is closed: {0}")]
    QueueClosed(String),

    /// Prometheus registry error
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error means the backend could not be reached.
    pub fn is_connection(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Redis(e) => e.is_io_error() || e.is_connection_dropped() || e.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_not_found_display() {
        let err = Error::JobNotFound {
            queue: "orders".into(),
            job_id: "42".into(),
        };
        assert_eq!(err.to_string(), "Job 42 not found in queue orders");
        assert!(!err.is_connection());
    }

    #[test]
    fn test_connection_error_classification() {
        let err = Error::Connection("refused".into());
        assert!(err.is_connection());
        assert_eq!(err.to_string(), "Backend connection error: refused");
    }
}
