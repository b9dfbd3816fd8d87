//! Health endpoint and probe
//!
//! The health path answers 200 without touching credentials or the backend, so
//! the load balancer keeps routing to a proxy that is busy denying traffic.
//! [`HealthPolicy`] mirrors the status codes the load balancer counts as
//! healthy, and [`probe`] applies it for container-level health checks.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

const HEALTH_BODY: &str = r#"{"status":"ok"}"#;

/// Default timeout for a single probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves the fixed health path
#[derive(Debug, Clone)]
pub struct HealthEndpoint {
    path: String,
}

impl HealthEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether `path` (query already stripped) is the health path
    pub fn matches(&self, path: &str) -> bool {
        path == self.path
    }

    /// Always 200; HEAD gets headers only
    pub fn handle(&self, method: &Method) -> Response<BoxBody<Bytes, hyper::Error>> {
        let body = if method == Method::HEAD {
            Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
        } else {
            Full::new(Bytes::from_static(HEALTH_BODY.as_bytes()))
                .map_err(|never| match never {})
                .boxed()
        };

        let mut response = Response::new(body);
        let headers = response.headers_mut();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            hyper::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            hyper::header::CACHE_CONTROL,
            hyper::header::HeaderValue::from_static("no-store"),
        );
        response
    }
}

/// Status codes an external health check treats as healthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    healthy: Vec<StatusCode>,
}

impl Default for HealthPolicy {
    /// 200, 401, 301 and 302: an instance answering 401 is up, just guarding its door
    fn default() -> Self {
        Self {
            healthy: vec![
                StatusCode::OK,
                StatusCode::UNAUTHORIZED,
                StatusCode::MOVED_PERMANENTLY,
                StatusCode::FOUND,
            ],
        }
    }
}

impl HealthPolicy {
    pub fn is_healthy(&self, status: StatusCode) -> bool {
        self.healthy.contains(&status)
    }
}

/// Issue one GET against `url` and return the response status
pub async fn probe(url: &str, timeout: Duration) -> anyhow::Result<StatusCode> {
    let uri: Uri = url
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid probe URL '{}': {}", url, e))?;

    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(timeout));
    let client: Client<HttpConnector, Empty<Bytes>> =
        Client::builder(TokioExecutor::new()).build(connector);

    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Empty::<Bytes>::new())?;

    let response = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| anyhow::anyhow!("Probe timed out after {}s", timeout.as_secs()))??;

    debug!(url, status = %response.status(), "Probe response");
    Ok(response.status())
}
