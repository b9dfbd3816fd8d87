use crate::auth::{Authenticator, DenyReason, ProxyDecision};
use crate::config::Config;
use crate::credentials::Credentials;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::health::HealthEndpoint;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single hop and are never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers carrying proxy credentials, removed before forwarding
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "proxy-authorization"];

/// Read-only state shared by every request handler
pub struct ProxyState {
    authenticator: Authenticator,
    health: HealthEndpoint,
    pool: ConnectionPool,
}

impl ProxyState {
    pub fn new(config: &Config, credentials: Arc<Credentials>) -> anyhow::Result<Self> {
        let target = config.backend_target()?;
        let pool = ConnectionPool::new(target.clone(), PoolConfig::from(&config.backend))?;
        Ok(Self {
            authenticator: Authenticator::new(credentials, target, &config.auth.realm),
            health: HealthEndpoint::new(config.server.health_path.clone()),
            pool,
        })
    }
}

/// The authenticating reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
    grace_period: Duration,
}

impl ProxyServer {
    pub fn new(
        config: &Config,
        credentials: Arc<Credentials>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr: config.listen_addr()?,
            state: Arc::new(ProxyState::new(config, credentials)?),
            shutdown_rx,
            grace_period: config.shutdown_grace_period(),
        })
    }

    /// Get the connection pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        self.state.pool.stats()
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            backend = %self.state.pool.target(),
            health_path = self.state.health.path(),
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means stop
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);

        let open = connections.len();
        if open > 0 {
            debug!(open, grace_secs = self.grace_period.as_secs(), "Draining connections");
            let drained = tokio::time::timeout(self.grace_period, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(remaining = connections.len(), "Grace period elapsed, aborting connections");
                connections.abort_all();
            }
        }

        let stats = self.state.pool.stats();
        info!(
            forwarded = stats.get_total_requests(),
            upstream_failures = stats.get_upstream_failures(),
            timeouts = stats.get_timeouts(),
            "Proxy server stopped"
        );

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                return result.map_err(|e| anyhow::anyhow!("Connection error: {}", e));
            }
            _ = shutdown_rx.wait_for(|stop| *stop), if !draining => {
                // Finish the in-flight exchange, refuse new ones
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}

/// Per-request lifecycle: health short-circuit, target validation,
/// authentication, then either rejection or forwarding.
async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let http1 = req.version() < Version::HTTP_2;
    let path = req.uri().path().to_string();

    // Health probes never touch credentials or the backend
    if state.health.matches(&path) {
        debug!(%method, path, "Health check");
        return Ok(state.health.handle(&method));
    }

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(reason) = validate_target(&req) {
        warn!(%method, path, request_id, reason, "Malformed request");
        let response = json_error_response(ProxyErrorCode::MalformedRequest, reason);
        let response = finish(response, &request_id, http1);
        log_completion(&method, &path, &request_id, "malformed", &response, started);
        return Ok(response);
    }

    let target = match state.authenticator.authenticate(&path, req.headers()) {
        ProxyDecision::Allow(target) => target,
        ProxyDecision::Deny { status, reason } => {
            warn!(%method, path, request_id, status = status.as_u16(), reason = reason.as_str(), "Request rejected");
            let response = reject(reason, state.authenticator.challenge());
            let response = finish(response, &request_id, http1);
            log_completion(&method, &path, &request_id, reason.as_str(), &response, started);
            return Ok(response);
        }
    };
    debug!(%method, path, request_id, backend = %target, "Forwarding request");

    prepare_forward_headers(req.headers_mut(), client_addr, &request_id);

    let response = match state.pool.send_request(req).await {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Err(e) if e.is_timeout() => {
            warn!(%method, path, request_id, backend = %target, error = %e, "Backend timed out");
            json_error_response(ProxyErrorCode::UpstreamTimeout, "Backend did not respond in time")
        }
        Err(e) => {
            // Log detailed error internally, return generic message externally
            error!(%method, path, request_id, backend = %target, error = %e, "Failed to forward request");
            json_error_response(ProxyErrorCode::UpstreamUnavailable, "Failed to reach backend")
        }
    };

    let response = finish(response, &request_id, false);
    log_completion(&method, &path, &request_id, "allow", &response, started);
    Ok(response)
}

/// Reject authority-form (CONNECT) and asterisk-form targets; only the path is forwarded
fn validate_target(req: &Request<Incoming>) -> Result<(), &'static str> {
    if req.method() == Method::CONNECT {
        return Err("CONNECT is not supported");
    }
    if !req.uri().path().starts_with('/') {
        return Err("Request path must start with '/'");
    }
    Ok(())
}

fn reject(reason: DenyReason, challenge: &HeaderValue) -> Response<BoxBody<Bytes, hyper::Error>> {
    let code = match reason {
        DenyReason::MissingCredentials => ProxyErrorCode::MissingCredentials,
        DenyReason::InvalidCredentials => ProxyErrorCode::InvalidCredentials,
    };
    let mut response = json_error_response(code, reason.as_str());
    response
        .headers_mut()
        .insert(hyper::header::WWW_AUTHENTICATE, challenge.clone());
    response
}

/// Stamp the request ID and, for refused HTTP/1 requests, close the connection
/// rather than draining whatever body the client is still sending.
fn finish(
    mut response: Response<BoxBody<Bytes, hyper::Error>>,
    request_id: &str,
    close: bool,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if close {
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("close"));
    }
    response
}

fn log_completion(
    method: &Method,
    path: &str,
    request_id: &str,
    decision: &str,
    response: &Response<BoxBody<Bytes, hyper::Error>>,
    started: Instant,
) {
    info!(
        %method,
        path,
        request_id,
        decision,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
}

/// Remove credentials and hop-by-hop headers, then add forwarding metadata
pub fn prepare_forward_headers(headers: &mut HeaderMap, client_addr: SocketAddr, request_id: &str) {
    for name in CREDENTIAL_HEADERS {
        headers.remove(*name);
    }
    strip_hop_by_hop(headers);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // The load balancer in front is a trusted hop: extend its chain instead of replacing it
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }
}

/// Drop hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.7:51000".parse().unwrap()
    }

    #[test]
    fn test_forward_headers_strip_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic YWRtaW46cHc="));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic abc"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        prepare_forward_headers(&mut headers, addr(), "req-1");

        assert!(headers.get("authorization").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
    }

    #[test]
    fn test_forwarded_for_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("198.51.100.1"));
        prepare_forward_headers(&mut headers, addr(), "req-1");
        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "198.51.100.1, 203.0.113.7"
        );

        let mut headers = HeaderMap::new();
        prepare_forward_headers(&mut headers, addr(), "req-2");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_host_and_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, HeaderValue::from_static("api.example.com"));
        prepare_forward_headers(&mut headers, addr(), "req-1");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "api.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        prepare_forward_headers(&mut headers, addr(), "req-1");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-length", HeaderValue::from_static("10"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-length").unwrap(), "10");
    }

    #[test]
    fn test_reject_carries_challenge() {
        let challenge = HeaderValue::from_static("Basic realm=\"test\"");
        let response = reject(DenyReason::InvalidCredentials, &challenge);
        assert_eq!(response.status(), hyper::StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(hyper::header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"test\""
        );
        assert_eq!(
            response.headers().get(crate::error::X_PROXY_ERROR).unwrap(),
            "INVALID_CREDENTIALS"
        );
    }

    #[test]
    fn test_finish_sets_request_id_and_close() {
        let response = json_error_response(ProxyErrorCode::MalformedRequest, "bad");
        let response = finish(response, "abc", true);
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "abc");
        assert_eq!(response.headers().get(hyper::header::CONNECTION).unwrap(), "close");

        let response = json_error_response(ProxyErrorCode::UpstreamTimeout, "slow");
        let response = finish(response, "abc", false);
        assert!(response.headers().get(hyper::header::CONNECTION).is_none());
    }
}
