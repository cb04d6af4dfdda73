//! Connection Manager
//!
//! Creates Redis connections classified by the kind of operation they serve.
//! Basic commands share one long-lived connection; subscribe and blocking
//! operations get a fresh connection each time. Address, credentials and TLS
//! are resolved once, at construction, and applied to every connection.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use tracing::{debug, info, warn};

use crate::config::{ConnectionOptions, TLS_SCHEME};
use crate::domain::ports::{KeyScan, KeyspaceClient};
use crate::error::{Error, Result};

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 1000;

// =============================================================================
// Connection Kind
// =============================================================================

/// Kind of operation a connection is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Plain commands: scanning, fetching, health checks
    Basic,
    /// Pub/sub event channel
    Subscribe,
    /// Long-poll commands
    Blocking,
}

impl ConnectionKind {
    /// Whether requests of this kind are served by the shared connection.
    pub fn is_shared(&self) -> bool {
        matches!(self, ConnectionKind::Basic)
    }
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Basic => write!(f, "basic"),
            ConnectionKind::Subscribe => write!(f, "subscribe"),
            ConnectionKind::Blocking => write!(f, "blocking"),
        }
    }
}

// =============================================================================
// TLS Policy
// =============================================================================

/// TLS settings applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsPolicy {
    /// TLS enabled
    pub enabled: bool,
    /// Certificate validation disabled
    pub insecure: bool,
}

impl TlsPolicy {
    /// No TLS.
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            insecure: false,
        }
    }

    /// TLS without certificate validation, for compatibility with managed
    /// Redis offerings that present self-signed certificates.
    pub const fn compatible() -> Self {
        Self {
            enabled: true,
            insecure: true,
        }
    }

    /// Resolve the policy for a set of options.
    ///
    /// TLS is on when requested explicitly, or when no explicit host was
    /// given and the URL uses the `rediss://` scheme.
    pub fn resolve(opts: &ConnectionOptions) -> Self {
        let from_url = opts.explicit_host().is_none() && opts.url.starts_with(TLS_SCHEME);
        if opts.tls || from_url {
            Self::compatible()
        } else {
            Self::disabled()
        }
    }
}

// =============================================================================
// Store Connection
// =============================================================================

struct ConnectionState {
    id: u64,
    kind: ConnectionKind,
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    established: AtomicBool,
    closed: AtomicBool,
    /// Set when `disconnect` could not take the lock to drop the connection.
    release_pending: AtomicBool,
}

impl ConnectionState {
    /// Get the multiplexed connection, establishing it on first use.
    async fn multiplexed(&self) -> Result<MultiplexedConnection> {
        if self.closed.load(Ordering::Acquire) {
            if self.release_pending.swap(false, Ordering::AcqRel) {
                self.conn.lock().await.take();
                debug!(connection = self.id, kind = %self.kind, "released connection after disconnect");
            }
            return Err(Error::Connection(format!("{} connection closed", self.kind)));
        }

        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection(format!("{} connection closed", self.kind)));
        }

        debug!(connection = self.id, kind = %self.kind, "established redis connection");
        *guard = Some(conn.clone());
        self.established.store(true, Ordering::Release);
        Ok(conn)
    }
}

/// A connection to the Redis backend.
///
/// Cheap to clone; clones refer to the same underlying connection. The
/// socket is opened lazily by the first command, so creating a connection
/// never fails.
#[derive(Clone)]
pub struct StoreConnection {
    state: Arc<ConnectionState>,
}

impl StoreConnection {
    fn new(id: u64, kind: ConnectionKind, client: redis::Client) -> Self {
        Self {
            state: Arc::new(ConnectionState {
                id,
                kind,
                client,
                conn: tokio::sync::Mutex::new(None),
                established: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                release_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Connection id, unique per manager.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Kind this connection was created for.
    pub fn kind(&self) -> ConnectionKind {
        self.state.kind
    }

    /// Resolved address, credentials and TLS settings.
    pub fn connection_info(&self) -> &ConnectionInfo {
        self.state.client.get_connection_info()
    }

    /// Whether TLS certificate validation is disabled for this connection.
    pub fn tls_insecure(&self) -> Option<bool> {
        match &self.connection_info().addr {
            ConnectionAddr::TcpTls { insecure, .. } => Some(*insecure),
            _ => None,
        }
    }

    /// Whether both handles refer to the same underlying connection.
    pub fn same_as(&self, other: &StoreConnection) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Whether `disconnect` has been requested.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Multiplexed connection for issuing commands.
    pub async fn multiplexed(&self) -> Result<MultiplexedConnection> {
        self.state.multiplexed().await
    }

    /// Open a pub/sub session subscribed to `channel`.
    pub async fn subscribe(&self, channel: &str) -> Result<PubSub> {
        if self.is_closed() {
            return Err(Error::Connection(format!("{} connection closed", self.kind())));
        }

        let mut pubsub = self
            .state
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        pubsub.subscribe(channel).await?;

        debug!(connection = self.id(), channel = %channel, "subscribed");
        Ok(pubsub)
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("addr", &self.connection_info().addr.to_string())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn scan_step(
    state: Arc<ConnectionState>,
    pattern: Arc<str>,
    cursor: Option<u64>,
) -> Result<Option<(Vec<String>, Option<u64>)>> {
    let Some(cursor) = cursor else {
        return Ok(None);
    };

    let mut conn = state.multiplexed().await?;
    let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern.as_ref())
        .arg("COUNT")
        .arg(SCAN_COUNT)
        .query_async(&mut conn)
        .await?;

    let next = if next == 0 { None } else { Some(next) };
    Ok(Some((keys, next)))
}

#[async_trait]
impl KeyspaceClient for StoreConnection {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.multiplexed().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(())
    }

    fn scan_match(&self, pattern: &str) -> KeyScan {
        let state = self.state.clone();
        let pattern: Arc<str> = Arc::from(pattern);

        stream::try_unfold(Some(0u64), move |cursor| {
            scan_step(state.clone(), pattern.clone(), cursor)
        })
        .boxed()
    }

    fn disconnect(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A connect racing with us notices `closed` and drops its result.
        match self.state.conn.try_lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(_) => self.state.release_pending.store(true, Ordering::Release),
        }
        debug!(connection = self.id(), kind = %self.kind(), "disconnect requested");
    }

    fn is_connected(&self) -> bool {
        self.state.established.load(Ordering::Acquire) && !self.is_closed()
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Hands out backend connections by [`ConnectionKind`].
pub struct ConnectionManager {
    client: redis::Client,
    tls: TlsPolicy,
    explicit: bool,
    shared: StoreConnection,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Resolve address and TLS settings and create the shared connection.
    ///
    /// Fails only on invalid configuration; nothing is dialled here.
    pub fn new(opts: &ConnectionOptions) -> Result<Self> {
        let tls = TlsPolicy::resolve(opts);
        let explicit = opts.explicit_host().is_some();
        let info = resolve_connection_info(opts, tls)?;

        let client = redis::Client::open(info)
            .map_err(|e| Error::Config(format!("invalid redis connection settings: {}", e)))?;

        info!(
            addr = %client.get_connection_info().addr,
            db = client.get_connection_info().redis.db,
            tls = tls.enabled,
            mode = if explicit { "explicit" } else { "url" },
            "configured redis backend"
        );

        let shared = StoreConnection::new(0, ConnectionKind::Basic, client.clone());

        Ok(Self {
            client,
            tls,
            explicit,
            shared,
            next_id: AtomicU64::new(1),
        })
    }

    /// Get a connection for `kind`.
    ///
    /// Basic requests always return the shared connection; subscribe and
    /// blocking requests always return a new one owned by the caller.
    pub fn connection(&self, kind: ConnectionKind) -> StoreConnection {
        if kind.is_shared() {
            return self.shared.clone();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, kind = %kind, "creating dedicated redis connection");
        StoreConnection::new(id, kind, self.client.clone())
    }

    /// The shared connection.
    pub fn shared(&self) -> &StoreConnection {
        &self.shared
    }

    /// TLS policy applied to every connection.
    pub fn tls(&self) -> TlsPolicy {
        self.tls
    }

    /// Whether explicit host/port settings were used.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.client.get_connection_info().addr.to_string())
            .field("tls", &self.tls)
            .field("explicit", &self.explicit)
            .finish()
    }
}

fn resolve_connection_info(opts: &ConnectionOptions, tls: TlsPolicy) -> Result<ConnectionInfo> {
    let mut info = match opts.explicit_host() {
        Some(host) => ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), opts.port.unwrap_or(6379)),
            redis: RedisConnectionInfo {
                db: opts.db.unwrap_or(0),
                username: opts.username.clone().filter(|u| !u.is_empty()),
                password: opts.password.clone(),
                ..Default::default()
            },
        },
        None => opts
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| Error::Config(format!("invalid redis url: {}", e)))?,
    };

    if tls.enabled {
        info.addr = match info.addr {
            ConnectionAddr::Tcp(host, port) | ConnectionAddr::TcpTls { host, port, .. } => {
                ConnectionAddr::TcpTls {
                    host,
                    port,
                    insecure: tls.insecure,
                    tls_params: None,
                }
            }
            other => {
                warn!(addr = %other, "TLS requested for a non-TCP address; ignoring");
                other
            }
        };
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn explicit_opts(tls: bool) -> ConnectionOptions {
        ConnectionOptions {
            tls,
            username: Some("app".into()),
            password: Some("secret".into()),
            db: Some(2),
            ..ConnectionOptions::explicit("cache.internal", 6380)
        }
    }

    #[test]
    fn test_basic_returns_shared_connection() {
        let manager = ConnectionManager::new(&ConnectionOptions::default()).unwrap();

        let a = manager.connection(ConnectionKind::Basic);
        let b = manager.connection(ConnectionKind::Basic);

        assert!(a.same_as(&b));
        assert!(a.same_as(manager.shared()));
        assert_eq!(a.kind(), ConnectionKind::Basic);
    }

    #[test]
    fn test_subscribe_and_blocking_are_fresh() {
        let manager = ConnectionManager::new(&ConnectionOptions::default()).unwrap();

        let sub1 = manager.connection(ConnectionKind::Subscribe);
        let sub2 = manager.connection(ConnectionKind::Subscribe);
        let blocking = manager.connection(ConnectionKind::Blocking);

        assert!(!sub1.same_as(&sub2));
        assert!(!sub1.same_as(manager.shared()));
        assert!(!blocking.same_as(manager.shared()));
        assert_ne!(sub1.id(), sub2.id());
        assert_eq!(blocking.kind(), ConnectionKind::Blocking);
        assert_eq!(
            sub1.connection_info().addr.to_string(),
            manager.shared().connection_info().addr.to_string()
        );
    }

    #[test]
    fn test_explicit_host_with_tls_disables_validation() {
        let manager = ConnectionManager::new(&explicit_opts(true)).unwrap();

        assert!(manager.is_explicit());
        assert_eq!(manager.tls(), TlsPolicy::compatible());
        for kind in [
            ConnectionKind::Basic,
            ConnectionKind::Subscribe,
            ConnectionKind::Blocking,
        ] {
            let conn = manager.connection(kind);
            assert_eq!(conn.tls_insecure(), Some(true), "kind {}", kind);
        }

        let info = manager.shared().connection_info();
        assert_matches!(&info.addr, ConnectionAddr::TcpTls { host, port: 6380, .. } if host == "cache.internal");
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_secure_scheme_url_implies_tls() {
        let manager =
            ConnectionManager::new(&ConnectionOptions::from_url("rediss://cache:6379")).unwrap();

        assert!(!manager.is_explicit());
        assert_eq!(manager.tls(), TlsPolicy::compatible());
        assert_eq!(manager.shared().tls_insecure(), Some(true));
        assert_eq!(
            manager.connection(ConnectionKind::Subscribe).tls_insecure(),
            Some(true)
        );
    }

    #[test]
    fn test_plain_url_has_no_tls() {
        let manager =
            ConnectionManager::new(&ConnectionOptions::from_url("redis://cache:6379/4")).unwrap();

        assert_eq!(manager.tls(), TlsPolicy::disabled());
        assert_eq!(manager.shared().tls_insecure(), None);
        assert_eq!(manager.shared().connection_info().redis.db, 4);
    }

    #[test]
    fn test_explicit_mode_ignores_url_scheme() {
        let opts = ConnectionOptions {
            url: "rediss://elsewhere:6379".into(),
            ..ConnectionOptions::explicit("cache.internal", 6379)
        };
        let manager = ConnectionManager::new(&opts).unwrap();

        assert_eq!(manager.tls(), TlsPolicy::disabled());
        assert_matches!(
            &manager.shared().connection_info().addr,
            ConnectionAddr::Tcp(host, 6379) if host == "cache.internal"
        );
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = ConnectionManager::new(&ConnectionOptions::from_url("not a url"));
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_disconnect_before_use() {
        let manager = ConnectionManager::new(&ConnectionOptions::default()).unwrap();
        let shared = manager.shared().clone();

        assert!(!shared.is_connected());
        shared.disconnect();
        shared.disconnect();

        assert!(shared.is_closed());
        assert!(!shared.is_connected());
        assert_matches!(shared.ping().await, Err(Error::Connection(_)));
    }

    #[tokio::test]
    async fn test_disconnect_while_locked_releases_on_next_use() {
        let manager = ConnectionManager::new(&ConnectionOptions::default()).unwrap();
        let shared = manager.shared().clone();

        let guard = shared.state.conn.lock().await;
        shared.disconnect();
        assert!(shared.state.release_pending.load(Ordering::Acquire));
        drop(guard);

        assert_matches!(shared.multiplexed().await, Err(Error::Connection(_)));
        assert!(!shared.state.release_pending.load(Ordering::Acquire));
        assert!(shared.state.conn.try_lock().unwrap().is_none());
    }

    #[test]
    fn test_connection_kind_display() {
        assert_eq!(ConnectionKind::Basic.to_string(), "basic");
        assert_eq!(ConnectionKind::Subscribe.to_string(), "subscribe");
        assert_eq!(ConnectionKind::Blocking.to_string(), "blocking");
        assert!(ConnectionKind::Basic.is_shared());
        assert!(!ConnectionKind::Blocking.is_shared());
    }
}
