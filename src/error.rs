//! Error types for the registry core and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the registry core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unsupported runtime, malformed name/version/alias, reserved word.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Function or version unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A version with the same key but different content already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The port allocator could not obtain a free loopback port.
    #[error("no free loopback port: {0}")]
    PortExhausted(String),

    /// The sandbox binary could not be spawned.
    #[error("failed to start sandbox: {0}")]
    RuntimeStartFailed(String),

    /// The sandbox never answered the readiness probe.
    #[error("sandbox not ready: {0}")]
    RuntimeStartTimeout(String),

    /// A suspended version could not be resumed.
    #[error("failed to wake function: {0}")]
    WakeFailed(String),

    /// Store read or write failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code presented to control API clients.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for response bodies and headers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "INVALID_INPUT",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::PortExhausted(_) => "PORT_EXHAUSTED",
            Error::RuntimeStartFailed(_) => "RUNTIME_START_FAILED",
            Error::RuntimeStartTimeout(_) => "RUNTIME_START_TIMEOUT",
            Error::WakeFailed(_) => "WAKE_FAILED",
            Error::Persistence(_) => "PERSISTENCE_FAILED",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Persistence(err.to_string())
    }
}

/// Error codes for the proxy surface
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing or invalid Host header in request
    MissingHostHeader,
    /// No function resolves to this host
    FunctionNotFound,
    /// A suspended function could not be woken
    WakeFailed,
    /// Failed to connect to the sandbox
    ConnectionFailed,
    /// Request to the sandbox timed out
    RequestTimeout,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::FunctionNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::WakeFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Code string for the X-Funcgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::FunctionNotFound => "FUNCTION_NOT_FOUND",
            ProxyErrorCode::WakeFailed => "WAKE_FAILED",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body for proxy errors
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Funcgate-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Funcgate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_status_codes() {
        assert_eq!(
            Error::InvalidInput("bad runtime".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("hello".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::AlreadyExists("v1".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::RuntimeStartTimeout("port 9999".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            Error::Persistence("disk full".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_registry_error_codes_are_stable() {
        assert_eq!(Error::PortExhausted(String::new()).code(), "PORT_EXHAUSTED");
        assert_eq!(Error::WakeFailed(String::new()).code(), "WAKE_FAILED");
        assert_eq!(
            Error::RuntimeStartFailed(String::new()).code(),
            "RUNTIME_START_FAILED"
        );
    }

    #[test]
    fn test_proxy_error_response_json() {
        let error = ErrorResponse::new(
            ProxyErrorCode::FunctionNotFound,
            "no function for host: v9.hello.func.local",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"FUNCTION_NOT_FOUND\""));
        assert!(json.contains("v9.hello.func.local"));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::WakeFailed, "spawn failed");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Funcgate-Error").unwrap(),
            "WAKE_FAILED"
        );
    }
}
