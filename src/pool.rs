//! Connection pool for the backend
//!
//! Wraps a pooled hyper client pointed at the single configured upstream. A
//! semaphore caps how many requests may be in flight to the backend at once,
//! and every exchange is bounded by the connect and response timeouts.

use crate::config::{BackendConfig, BackendTarget};
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Could not open a connection (refused, unreachable, or connect timeout)
    #[error("failed to connect to backend: {0}")]
    Connect(#[source] hyper_util::client::legacy::Error),
    /// Connection opened but the exchange failed
    #[error("backend request failed: {0}")]
    Client(#[source] hyper_util::client::legacy::Error),
    /// No response headers within the response timeout
    #[error("backend did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
    /// Error building the upstream request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

impl PoolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Timeout(_))
    }
}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            PoolError::Connect(err)
        } else {
            PoolError::Client(err)
        }
    }
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests handed to the backend
    pub total_requests: AtomicU64,
    /// Requests that failed with a connect or transport error
    pub upstream_failures: AtomicU64,
    /// Requests that hit the response timeout
    pub timeouts: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the backend
    pub max_idle: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Time allowed to establish a backend connection
    pub connect_timeout: Duration,
    /// Time allowed for the backend to produce response headers
    pub response_timeout: Duration,
    /// Maximum simultaneous in-flight backend requests
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            max_concurrent: 256,
        }
    }
}

impl From<&BackendConfig> for PoolConfig {
    fn from(config: &BackendConfig) -> Self {
        Self {
            max_idle: config.pool_max_idle,
            idle_timeout: config.pool_idle_timeout(),
            connect_timeout: config.connect_timeout(),
            response_timeout: config.response_timeout(),
            max_concurrent: config.max_concurrent,
        }
    }
}

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    target: BackendTarget,
    host_header: HeaderValue,
    limiter: Semaphore,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(target: BackendTarget, config: PoolConfig) -> Result<Self, PoolError> {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        let host_header = HeaderValue::from_str(&target.authority())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        debug!(
            backend = %target,
            max_idle = config.max_idle,
            max_concurrent = config.max_concurrent,
            connect_timeout_secs = config.connect_timeout.as_secs(),
            response_timeout_secs = config.response_timeout.as_secs(),
            "Connection pool initialized"
        );

        Ok(Self {
            client,
            target,
            host_header,
            limiter: Semaphore::new(config.max_concurrent),
            stats: Arc::new(PoolStats::default()),
            config,
        })
    }

    pub fn target(&self) -> &BackendTarget {
        &self.target
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Upstream slots currently free
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Send a request to the backend and return its streaming response.
    ///
    /// Waiting for a concurrency slot counts against the response timeout.
    /// Dropping the returned future aborts the upstream exchange.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let backend_req = self.rewrite_for_backend(req)?;
        let response_timeout = self.config.response_timeout;

        let exchange = async {
            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
            self.stats.record_request();
            self.client.request(backend_req).await.map_err(PoolError::from)
        };

        let response = match tokio::time::timeout(response_timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_failure();
                return Err(e);
            }
            Err(_) => {
                self.stats.record_timeout();
                return Err(PoolError::Timeout(response_timeout));
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Point the request at the backend: absolute URI, HTTP/1.1, backend Host
    fn rewrite_for_backend(&self, req: Request<Incoming>) -> Result<Request<Incoming>, PoolError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", self.target.authority(), path_and_query)
            .parse::<Uri>()
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        parts.headers.insert(HOST, self.host_header.clone());

        Ok(Request::from_parts(parts, body))
    }
}
