//! Bull Exporter
//!
//! Serves Prometheus metrics for Bull job queues.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Bull Exporter                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  Discovery   │───▶│  Collector   │───▶│ HTTP Server  │       │
//! │  │    Loop      │    │  (gauges)    │    │  /metrics    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bull_exporter::config::{
    build_redis_url, RedisUrlParts, DEFAULT_METRIC_PREFIX, DEFAULT_PREFIX,
};
use bull_exporter::error::{Error, Result};
use bull_exporter::metrics::{encode_text, text_content_type};
use bull_exporter::{CollectorOptions, ConnectionOptions, MetricCollector};
use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Bull Exporter - Prometheus metrics for Bull job queues
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis URL; built from the discrete options below when absent
    #[arg(short = 'u', long, env = "EXPORTER_REDIS_URL")]
    redis_url: Option<String>,

    /// Redis host; connects with explicit parameters instead of the URL
    #[arg(long, env = "EXPORTER_REDIS_HOST")]
    redis_host: Option<String>,

    /// Redis port
    #[arg(long, env = "EXPORTER_REDIS_CONNECTION_PORT")]
    redis_connection_port: Option<u16>,

    /// Redis username
    #[arg(long, env = "EXPORTER_REDIS_USERNAME")]
    redis_username: Option<String>,

    /// Redis password
    #[arg(long, env = "EXPORTER_REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Redis database index
    #[arg(long, env = "EXPORTER_REDIS_DB")]
    redis_db: Option<i64>,

    /// Use TLS for every Redis connection
    #[arg(long, env = "EXPORTER_REDIS_TLS")]
    redis_tls: bool,

    /// Bull key prefix
    #[arg(short = 'p', long, env = "EXPORTER_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Prefix for exported metric names
    #[arg(short = 'm', long, env = "EXPORTER_METRIC_PREFIX", default_value = DEFAULT_METRIC_PREFIX)]
    metric_prefix: String,

    /// Print metrics once and exit
    #[arg(short = 'n', long, env = "EXPORTER_ONCE")]
    once: bool,

    /// HTTP port
    #[arg(long, env = "EXPORTER_PORT", default_value = "9538")]
    port: u16,

    /// HTTP bind address
    #[arg(short = 'b', long, env = "EXPORTER_BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Discover queues by scanning Redis
    #[arg(short = 'a', long, env = "EXPORTER_AUTO_DISCOVER")]
    auto_discover: bool,

    /// Re-run discovery at this interval (0 = only at start-up)
    #[arg(long, env = "EXPORTER_DISCOVER_INTERVAL_SECONDS", default_value = "0")]
    discover_interval_seconds: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "EXPORTER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "EXPORTER_LOG_JSON")]
    log_json: bool,

    /// Queue names to observe
    queues: Vec<String>,
}

impl Args {
    fn connection_options(&self) -> ConnectionOptions {
        let url = match self.redis_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => url.to_string(),
            None => build_redis_url(&RedisUrlParts {
                host: self.redis_host.as_deref(),
                port: self.redis_connection_port,
                username: self.redis_username.as_deref(),
                password: self.redis_password.as_deref(),
                db: self.redis_db,
                tls: self.redis_tls,
            }),
        };

        ConnectionOptions {
            url,
            host: self.redis_host.clone(),
            port: self.redis_connection_port,
            username: self.redis_username.clone(),
            password: self.redis_password.clone(),
            db: self.redis_db,
            tls: self.redis_tls,
        }
    }

    fn collector_options(&self) -> CollectorOptions {
        CollectorOptions {
            prefix: self.prefix.clone(),
            metric_prefix: self.metric_prefix.clone(),
            auto_discover: self.auto_discover,
            connection: self.connection_options(),
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Bull Exporter");
    info!("  Prefix: {}", args.prefix);
    info!("  Metric prefix: {}", args.metric_prefix);
    info!("  Queues: {:?}", args.queues);
    info!("  Auto discover: {}", args.auto_discover);

    let registry = Registry::new();
    let collector = Arc::new(MetricCollector::connect(
        &args.queues,
        args.collector_options(),
        std::slice::from_ref(&registry),
    )?);

    if collector.options().auto_discover {
        discover(&collector).await?;
    }

    if args.once {
        let result = print_once(&collector, &registry).await;
        collector.close().await?;
        return result;
    }

    let enabled = collector.collect_job_completions().await;
    info!(queues = enabled, "tracking job completions");

    let shutdown = CancellationToken::new();

    let discovery_task = (collector.options().auto_discover && args.discover_interval_seconds > 0)
        .then(|| {
            tokio::spawn(run_discovery_loop(
                collector.clone(),
                Duration::from_secs(args.discover_interval_seconds),
                shutdown.clone(),
            ))
        });

    let state = Arc::new(ServerState {
        collector: collector.clone(),
        registry,
    });
    let addr = SocketAddr::new(args.bind_address, args.port);

    let mut server = tokio::spawn(run_metrics_server(addr, state, shutdown.clone()));

    let finished = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            None
        }
        result = &mut server => Some(result),
    };
    shutdown.cancel();

    if let Some(task) = discovery_task {
        let _ = task.await;
    }
    let server_result = match finished {
        Some(result) => result,
        None => server.await,
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Metrics server error: {}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
    }

    collector.close().await?;
    info!("Exporter shutdown complete");
    Ok(())
}

async fn discover(collector: &MetricCollector) -> Result<()> {
    let report = collector.discover_all().await?;
    info!(
        scanned = report.scanned,
        added = report.added.len(),
        "discovered queues"
    );
    Ok(())
}

async fn print_once(collector: &MetricCollector, registry: &Registry) -> Result<()> {
    let summary = collector.update_all().await;
    if !summary.is_complete() {
        warn!(failed = ?summary.failed, "some queues could not be refreshed");
    }
    print!("{}", encode_text(registry)?);
    Ok(())
}

// =============================================================================
// Discovery Loop
// =============================================================================

async fn run_discovery_loop(
    collector: Arc<MetricCollector>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; start-up discovery already ran.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match discover(&collector).await {
            Ok(()) => {
                let enabled = collector.collect_job_completions().await;
                if enabled > 0 {
                    info!(queues = enabled, "tracking job completions for new queues");
                }
            }
            Err(e) if e.is_connection() => warn!(error = %e, "queue discovery failed; redis unreachable"),
            Err(e) => warn!(error = %e, "queue discovery failed"),
        }
    }

    debug!("Discovery loop stopped");
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

struct ServerState {
    collector: Arc<MetricCollector>,
    registry: Registry,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

async fn metrics_handler(state: &ServerState) -> Response<Full<Bytes>> {
    let summary = state.collector.update_all().await;
    if !summary.is_complete() {
        debug!(failed = ?summary.failed, "serving stale values for some queues");
    }

    match encode_text(&state.registry) {
        Ok(body) => {
            let mut response = text_response(StatusCode::OK, body);
            if let Ok(value) = HeaderValue::from_str(&text_content_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn health_handler(state: &ServerState) -> Response<Full<Bytes>> {
    match state.collector.ping().await {
        Ok(()) => text_response(StatusCode::OK, "ok"),
        Err(e) => {
            warn!(error = %e, "health check failed");
            text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn route(
    state: Arc<ServerState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => metrics_handler(&state).await,
        (&Method::GET, "/healthz") => health_handler(&state).await,
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind metrics server");
        Error::Io(e)
    })?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted.map_err(Error::Io)?,
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| route(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }

    info!("Metrics server stopped");
    Ok(())
}

// =============================================================================
// Signals
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("bull-exporter").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.prefix, "bull");
        assert_eq!(args.metric_prefix, "bull_queue_");
        assert_eq!(args.port, 9538);
        assert_eq!(args.bind_address.to_string(), "0.0.0.0");
        assert!(args.queues.is_empty());
        assert_eq!(args.connection_options().url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_url_built_from_parts() {
        let args = parse(&[
            "--redis-host",
            "cache",
            "--redis-connection-port",
            "6380",
            "--redis-password",
            "p@ss",
            "--redis-db",
            "2",
            "--redis-tls",
        ]);
        let opts = args.connection_options();
        assert_eq!(opts.url, "rediss://:p%40ss@cache:6380/2");
        assert_eq!(opts.explicit_host(), Some("cache"));
        assert!(opts.tls);
    }

    #[test]
    fn test_explicit_url_wins() {
        let args = parse(&["-u", "redis://other:1/3", "--redis-host", "cache"]);
        assert_eq!(args.connection_options().url, "redis://other:1/3");
    }

    #[test]
    fn test_short_flags_and_queues() {
        let args = parse(&["-p", "jobs", "-m", "q_", "-n", "-a", "mail", "orders"]);
        let opts = args.collector_options();
        assert_eq!(opts.prefix, "jobs");
        assert_eq!(opts.metric_prefix, "q_");
        assert!(opts.auto_discover);
        assert!(args.once);
        assert_eq!(args.queues, vec!["mail", "orders"]);
    }

    #[tokio::test]
    async fn test_bind_failure_is_io_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let collector = MetricCollector::with_parts(
            &[] as &[&str],
            CollectorOptions::default(),
            Arc::new(bull_exporter::adapters::InMemoryKeyspace::new()),
            Arc::new(bull_exporter::adapters::InMemoryQueueFactory::new()),
            Arc::new(bull_exporter::QueueGauges::new("bull_queue_", &[]).unwrap()),
        )
        .unwrap();
        let state = Arc::new(ServerState {
            collector: Arc::new(collector),
            registry: Registry::new(),
        });

        let result = run_metrics_server(addr, state, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
