//! Loopback port allocation and listen-readiness probing

use crate::error::{Error, Result};
use std::net::TcpListener;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Default readiness probe window.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default interval between probe attempts.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Obtain a currently-free loopback TCP port by binding to port 0 and
/// releasing the listener. The caller must start its process promptly; a
/// lost race with another process surfaces later as a start failure.
pub fn alloc_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| Error::PortExhausted(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::PortExhausted(e.to_string()))?
        .port();
    Ok(port)
}

/// Wait until something accepts TCP connections on `127.0.0.1:{port}`.
///
/// Retries every `interval` until `timeout` expires, then fails with
/// `RuntimeStartTimeout`.
pub async fn wait_port_ready(port: u16, timeout: Duration, interval: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::RuntimeStartTimeout(format!(
                "port {} not listening after {:?}",
                port, timeout
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_port_returns_usable_port() {
        let port = alloc_port().unwrap();
        assert_ne!(port, 0);

        // The port was released; binding it again must succeed.
        let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_wait_port_ready_success() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Keep accepting so probe connects succeed.
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        wait_port_ready(port, Duration::from_secs(2), Duration::from_millis(20))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_port_ready_timeout() {
        // Allocate-then-release guarantees nothing is listening.
        let port = alloc_port().unwrap();

        let err = wait_port_ready(port, Duration::from_millis(200), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeStartTimeout(_)));
    }
}
