//! Reverse proxy for function traffic
//!
//! Resolves the Host header through the registry, wakes suspended versions,
//! and forwards the request byte-for-byte to the sandbox's loopback port.
//! Forwarding happens outside any registry lock; only a wake transition
//! briefly takes the write lock.

use crate::domains;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::UpstreamPool;
use crate::registry::Registry;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
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

/// The function traffic proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    pool: Arc<UpstreamPool>,
    request_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        pool: Arc<UpstreamPool>,
        request_timeout: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            pool,
            request_timeout,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pool = Arc::clone(&self.pool);
                            let request_timeout = self.request_timeout;

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let registry = Arc::clone(&registry);
                                    let pool = Arc::clone(&pool);
                                    async move {
                                        handle_request(req, registry, pool, addr, request_timeout)
                                            .await
                                    }
                                });

                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<Registry>,
    pool: Arc<UpstreamPool>,
    client_addr: SocketAddr,
    request_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let host = match req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(domains::normalize_host)
    {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "missing or invalid Host header",
            ));
        }
    };

    let target = match registry.resolve(&host).await {
        Ok(t) => t,
        Err(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::FunctionNotFound,
                format!("no function for host: {}", host),
            ));
        }
    };

    // Wake a suspended version before pointing traffic at it.
    let port = if target.running {
        target.port
    } else {
        match registry.ensure_running(&target.name, &target.version).await {
            Ok(port) => port,
            Err(e) => {
                error!(name = %target.name, version = %target.version, error = %e,
                       "Failed to wake function");
                return Ok(json_error_response(
                    ProxyErrorCode::WakeFailed,
                    "failed to wake function",
                ));
            }
        }
    };

    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    apply_forwarding_headers(req.headers_mut(), client_addr, &request_id);

    debug!(host = %host, method = %req.method(), uri = %req.uri(), %request_id, port, "Forwarding request");

    let result = tokio::time::timeout(request_timeout, pool.send_request(req, port)).await;

    match result {
        Ok(Ok(response)) => {
            registry.touch(&target.name, &target.version).await;
            Ok(response)
        }
        Ok(Err(e)) => {
            error!(host = %host, port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "failed to connect to function",
            ))
        }
        Err(_) => {
            warn!(
                host = %host,
                port,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!("request timed out after {} seconds", request_timeout.as_secs()),
            ))
        }
    }
}

/// Stamp the request ID and overwrite the X-Forwarded-* headers. Overwriting
/// rather than appending prevents client spoofing; this proxy is the first
/// trusted hop.
fn apply_forwarding_headers(headers: &mut HeaderMap, client_addr: SocketAddr, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::HOST,
            HeaderValue::from_static("v1.hello.func.local"),
        );
        // Spoofed values must be overwritten.
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));

        let addr: SocketAddr = "192.168.1.50:41000".parse().unwrap();
        apply_forwarding_headers(&mut headers, addr, "req-123");

        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-123");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.50");
        assert_eq!(
            headers.get(X_FORWARDED_HOST).unwrap(),
            "v1.hello.func.local"
        );
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }
}
