//! Control API server
//!
//! A thin validator in front of the registry: deserialize the request,
//! call the engine, serialize the outcome. All responses are JSON; success
//! bodies carry `{"status":"success","funcName":...}` plus operation
//! specific fields, errors carry `{"error": message}` with the status code
//! mapped from the error kind.

use crate::error::Error;
use crate::registry::{DeployIntent, Registry};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Deploy request body
#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub runtime: String,
    pub code: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Rollback request body
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// Stop / delete-version request body
#[derive(Debug, Deserialize)]
pub struct VersionRequest {
    pub version: String,
}

/// Control API server
pub struct ApiServer {
    bind_addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        bind_addr: SocketAddr,
        registry: Arc<Registry>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            registry,
            shutdown_rx,
        }
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream).await {
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
                        info!("Control API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(%method, %path, "API request");

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),

            (Method::GET, "/version") => {
                let version = json!({ "name": PKG_NAME, "version": VERSION });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }

            (Method::POST, p) if p.starts_with("/api/deploy/") => {
                let name = p.strip_prefix("/api/deploy/").unwrap_or("").to_string();
                self.deploy(&name, req).await
            }

            (Method::POST, p) if p.starts_with("/api/rollback/") => {
                let name = p.strip_prefix("/api/rollback/").unwrap_or("").to_string();
                self.rollback(&name, req).await
            }

            (Method::POST, p) if p.starts_with("/api/stop/") => {
                let name = p.strip_prefix("/api/stop/").unwrap_or("").to_string();
                self.stop(&name, req).await
            }

            (Method::POST, p)
                if p.starts_with("/api/delete/")
                    && p.ends_with("/version")
                    && p != "/api/delete/version" =>
            {
                let name = p
                    .strip_prefix("/api/delete/")
                    .and_then(|r| r.strip_suffix("/version"))
                    .unwrap_or("")
                    .to_string();
                self.delete_version(&name, req).await
            }

            (Method::POST, p) if p.starts_with("/api/delete/") => {
                let name = p.strip_prefix("/api/delete/").unwrap_or("").to_string();
                self.delete_function(&name).await
            }

            (Method::GET, p) if p.starts_with("/api/list/") => {
                let name = p.strip_prefix("/api/list/").unwrap_or("").to_string();
                self.list_versions(&name).await
            }

            _ => Ok(json_error(StatusCode::NOT_FOUND, "not found")),
        };

        response.or_else(|e| {
            error!(error = %e, "API error");
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error: {}", e),
            ))
        })
    }

    async fn deploy(
        &self,
        name: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let deploy_req: DeployRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        let intent = DeployIntent {
            name: name.to_string(),
            version: deploy_req.version,
            alias: deploy_req.alias,
            runtime: deploy_req.runtime,
            code: deploy_req.code,
            env: deploy_req.env_vars,
        };

        match self.registry.deploy(intent).await {
            Ok(deployed) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "success",
                    "funcName": deployed.name,
                    "subdomain": deployed.subdomain,
                    "accessUrl": deployed.access_url,
                    "version": deployed.version,
                    "alias": deployed.alias,
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }

    async fn rollback(
        &self,
        name: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let rollback_req: RollbackRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        match self
            .registry
            .rollback(name, &rollback_req.version, rollback_req.alias)
            .await
        {
            Ok(rolled) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "success",
                    "funcName": rolled.name,
                    "alias": rolled.alias,
                    "targetVersion": rolled.version,
                    "accessUrl": rolled.access_url,
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }

    async fn stop(
        &self,
        name: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let stop_req: VersionRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        match self.registry.stop(name, &stop_req.version).await {
            Ok(()) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "success",
                    "funcName": name,
                    "version": stop_req.version,
                    "message": "function stopped successfully",
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }

    async fn delete_version(
        &self,
        name: &str,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>> {
        let body = req.collect().await?.to_bytes();
        let delete_req: VersionRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                return Ok(json_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid JSON: {}", e),
                ))
            }
        };

        match self
            .registry
            .delete_version(name, &delete_req.version)
            .await
        {
            Ok(()) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "success",
                    "funcName": name,
                    "version": delete_req.version,
                    "message": "function version deleted successfully",
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }

    async fn delete_function(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        match self.registry.delete_function(name).await {
            Ok(()) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "status": "success",
                    "funcName": name,
                    "message": "function and all versions deleted successfully",
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }

    async fn list_versions(&self, name: &str) -> Result<Response<Full<Bytes>>> {
        match self.registry.list_versions(name).await {
            Ok(versions) => Ok(json_response(
                StatusCode::OK,
                json!({
                    "funcName": name,
                    "versions": versions,
                })
                .to_string(),
            )),
            Err(e) => Ok(registry_error(&e)),
        }
    }
}

// ==================== Helper Functions ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    json_response(
        status,
        json!({ "error": message.into() }).to_string(),
    )
}

fn registry_error(e: &Error) -> Response<Full<Bytes>> {
    json_error(e.status_code(), e.to_string())
}
