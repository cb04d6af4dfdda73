//! Collector and connection configuration
//!
//! The binary builds these from CLI flags / `EXPORTER_*` environment
//! variables; embedders can construct them directly.

use crate::error::{Error, Result};

/// Default Bull key prefix
pub const DEFAULT_PREFIX: &str = "bull";

/// Default prefix applied to every exported metric name
pub const DEFAULT_METRIC_PREFIX: &str = "bull_queue_";

/// Default Redis URL used when nothing else is configured
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// URL scheme that implies TLS
pub const TLS_SCHEME: &str = "rediss://";

// =============================================================================
// Connection Options
// =============================================================================

/// How to reach the Redis backend.
///
/// When `host` is set the explicit fields are used and `url` is ignored;
/// otherwise `url` alone describes the target. The two modes are never mixed.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Connection URL (`redis://` or `rediss://`)
    pub url: String,

    /// Explicit host, switches to explicit mode when non-empty
    pub host: Option<String>,

    /// Explicit port
    pub port: Option<u16>,

    /// Username (Redis >= 6 ACL)
    pub username: Option<String>,

    /// Password
    pub password: Option<String>,

    /// Database index
    pub db: Option<i64>,

    /// Force TLS on every connection
    pub tls: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            host: None,
            port: None,
            username: None,
            password: None,
            db: None,
            tls: false,
        }
    }
}

impl ConnectionOptions {
    /// Options for a single connection URL.
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Options for an explicit host/port pair.
    pub fn explicit(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Default::default()
        }
    }

    /// Explicit host, if one was given and is non-empty.
    pub fn explicit_host(&self) -> Option<&str> {
        self.host.as_deref().filter(|h| !h.is_empty())
    }
}

// =============================================================================
// Collector Options
// =============================================================================

/// Configuration for the metric collector
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Bull key prefix
    pub prefix: String,

    /// Prefix for exported metric names
    pub metric_prefix: String,

    /// Scan the keyspace for queues that were not configured explicitly
    pub auto_discover: bool,

    /// Backend connection
    pub connection: ConnectionOptions,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            metric_prefix: DEFAULT_METRIC_PREFIX.to_string(),
            auto_discover: false,
            connection: ConnectionOptions::default(),
        }
    }
}

impl CollectorOptions {
    /// Validate options that would otherwise fail later in confusing ways.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() {
            return Err(Error::Config("queue prefix must not be empty".into()));
        }
        if self.metric_prefix.is_empty() {
            return Err(Error::Config("metric prefix must not be empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// URL Builder
// =============================================================================

/// Parts used to assemble a Redis URL when none was given.
#[derive(Debug, Clone, Default)]
pub struct RedisUrlParts<'a> {
    pub host: Option<&'a str>,
    pub port: Option<u16>,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub db: Option<i64>,
    pub tls: bool,
}

/// Build a Redis URL from discrete parts.
///
/// Host defaults to `127.0.0.1`, port to 6379; the database index is only
/// appended when non-zero. Credentials are percent-encoded.
pub fn build_redis_url(parts: &RedisUrlParts<'_>) -> String {
    let host = parts.host.filter(|h| !h.is_empty()).unwrap_or("127.0.0.1");
    let port = parts.port.unwrap_or(6379);
    let db = parts.db.unwrap_or(0);

    let mut url = String::from(if parts.tls { TLS_SCHEME } else { "redis://" });

    match (parts.username.filter(|u| !u.is_empty()), parts.password) {
        (Some(user), Some(pass)) => {
            url.push_str(&format!(
                "{}:{}@",
                urlencoding::encode(user),
                urlencoding::encode(pass)
            ));
        }
        (Some(user), None) => url.push_str(&format!("{}@", urlencoding::encode(user))),
        (None, Some(pass)) => url.push_str(&format!(":{}@", urlencoding::encode(pass))),
        (None, None) => {}
    }

    url.push_str(&format!("{}:{}", host, port));
    if db != 0 {
        url.push_str(&format!("/{}", db));
    }

    url
}
