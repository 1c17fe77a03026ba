//! Integration tests for the funcgate registry and control API
//!
//! The sandbox success path needs a real workerd handshake, so these tests
//! exercise the lifecycle through its observable failure modes (shrunken
//! probe windows against binaries that never listen) and through full
//! store-reload round trips on a file-backed database.

use funcgate::api::ApiServer;
use funcgate::config::Config;
use funcgate::db::{Database, StoredFunction};
use funcgate::error::Error;
use funcgate::index::FunctionStatus;
use funcgate::ports;
use funcgate::registry::{Registry, RegistrySettings};
use funcgate::template::SandboxArtifacts;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

fn test_settings(storage: &Path, bin: &str) -> RegistrySettings {
    RegistrySettings {
        storage_dir: storage.to_path_buf(),
        sandbox_bin: bin.to_string(),
        startup_timeout: Duration::from_millis(300),
        probe_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(1),
        idle_threshold: Duration::from_secs(300),
        suspend_latest: false,
    }
}

fn seed_version(db: &Database, name: &str, version: &str, alias: Option<&str>, updated_at: &str) {
    let mut env = HashMap::new();
    env.insert("APP_ENV".to_string(), "production".to_string());
    db.upsert(&StoredFunction {
        name: name.to_string(),
        version: version.to_string(),
        subdomain: format!("{}.{}.func.local", version, name),
        alias: alias.map(String::from),
        runtime: "js".to_string(),
        code: format!("// {}", version),
        env,
        artifacts: SandboxArtifacts::default(),
        created_at: String::new(),
        updated_at: updated_at.to_string(),
    })
    .unwrap();
}

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send an HTTP request with an optional JSON body and return the raw response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        port,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::test]
async fn test_restart_reconstructs_registry() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("funcgate.db");

    // First life: seed two versions of `hello` (v2 aliased) plus `envTest`,
    // then load and drop.
    {
        let db = Database::open(&db_path).unwrap();
        seed_version(&db, "hello", "v1", None, "2026-01-01 10:00:00.000");
        seed_version(&db, "hello", "v2", Some("test"), "2026-01-01 11:00:00.000");
        seed_version(&db, "envTest", "v1", None, "2026-01-01 12:00:00.000");

        let registry = Registry::new(db, test_settings(dir.path(), "sleep"));
        assert_eq!(registry.load_from_store().await.unwrap(), 3);
    }

    // Second life: a fresh registry over the same file must reconstruct
    // every subdomain flavor, with all records suspended.
    let db = Database::open(&db_path).unwrap();
    let registry = Registry::new(db, test_settings(dir.path(), "sleep"));
    assert_eq!(registry.load_from_store().await.unwrap(), 3);

    let cases = [
        ("v1.hello.func.local", "hello", "v1"),
        ("v2.hello.func.local", "hello", "v2"),
        ("test.hello.func.local", "hello", "v2"),
        ("latest.hello.func.local", "hello", "v2"),
        ("hello.func.local", "hello", "v2"),
        ("v1.envTest.func.local", "envTest", "v1"),
        ("envTest.func.local", "envTest", "v1"),
    ];
    for (host, name, version) in cases {
        let target = registry.resolve(host).await.unwrap();
        assert_eq!(target.name, name, "host {}", host);
        assert_eq!(target.version, version, "host {}", host);
        assert!(!target.running, "host {} must come back suspended", host);
        assert_eq!(target.port, 0);
    }

    let versions = registry.list_versions("hello").await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions
        .iter()
        .all(|v| v.status == FunctionStatus::Suspended && v.pid == 0));
    assert_eq!(
        versions
            .iter()
            .find(|v| v.version == "v2")
            .and_then(|v| v.alias.as_deref()),
        Some("test")
    );
}

#[tokio::test]
async fn test_delete_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("funcgate.db");

    {
        let db = Database::open(&db_path).unwrap();
        seed_version(&db, "hello", "v1", None, "2026-01-01 10:00:00.000");
        seed_version(&db, "hello", "v2", None, "2026-01-01 11:00:00.000");
        seed_version(&db, "other", "v1", None, "2026-01-01 11:00:00.000");

        let registry = Registry::new(db, test_settings(dir.path(), "sleep"));
        registry.load_from_store().await.unwrap();

        // Deleting the latest version repoints latest to v1.
        registry.delete_version("hello", "v2").await.unwrap();
        let target = registry.resolve("hello.func.local").await.unwrap();
        assert_eq!(target.version, "v1");

        registry.delete_function("other").await.unwrap();
    }

    let db = Database::open(&db_path).unwrap();
    let registry = Registry::new(db, test_settings(dir.path(), "sleep"));
    assert_eq!(registry.load_from_store().await.unwrap(), 1);

    assert!(registry.resolve("v2.hello.func.local").await.is_err());
    assert!(registry.resolve("other.func.local").await.is_err());
    let target = registry.resolve("hello.func.local").await.unwrap();
    assert_eq!(target.version, "v1");
}

#[tokio::test]
async fn test_suspended_record_stays_addressable_after_failed_wake() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_in_memory().unwrap();
    seed_version(&db, "hello", "v1", None, "2026-01-01 10:00:00.000");

    let registry = Registry::new(db, test_settings(dir.path(), "/nonexistent/workerd"));
    registry.load_from_store().await.unwrap();

    let target = registry.resolve("hello.func.local").await.unwrap();
    assert!(!target.running);

    // The wake fails (binary missing) but the record must not disappear.
    let err = registry
        .ensure_running(&target.name, &target.version)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WakeFailed(_)));

    let target = registry.resolve("hello.func.local").await.unwrap();
    assert_eq!(target.version, "v1");
    assert!(!target.running);
}

#[tokio::test]
async fn test_control_api_surface() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = Database::open_in_memory().unwrap();
    seed_version(&db, "listed", "v1", None, "2026-01-01 10:00:00.000");

    let registry = Arc::new(Registry::new(db, test_settings(dir.path(), "sleep")));
    registry.load_from_store().await.unwrap();

    let port = ports::alloc_port().unwrap();
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let api = Arc::new(ApiServer::new(addr, Arc::clone(&registry), shutdown_rx));

    tokio::spawn(async move {
        let _ = api.run().await;
    });
    assert!(wait_for_port(port, Duration::from_secs(5)).await);

    // Liveness endpoints
    let resp = http_request(port, "GET", "/health", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains(r#""status":"ok""#));

    let resp = http_request(port, "GET", "/version", None).await.unwrap();
    assert!(resp.contains("funcgate"));

    // Unsupported runtime -> 400
    let resp = http_request(
        port,
        "POST",
        "/api/deploy/hello",
        Some(r#"{"runtime":"python","code":"print()"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 400"));
    assert!(resp.contains("unsupported runtime"));

    // Reserved alias -> 400
    let resp = http_request(
        port,
        "POST",
        "/api/deploy/hello",
        Some(r#"{"runtime":"js","code":"//","version":"v1","alias":"latest"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 400"));

    // Malformed body -> 400
    let resp = http_request(port, "POST", "/api/deploy/hello", Some("{not json"))
        .await
        .unwrap();
    assert!(resp.starts_with("HTTP/1.1 400"));
    assert!(resp.contains("invalid JSON"));

    // Sandbox never binds its port -> 500 with the probe error
    let resp = http_request(
        port,
        "POST",
        "/api/deploy/hello",
        Some(r#"{"runtime":"js","code":"export default {}","version":"v1"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 500"));
    assert!(resp.contains("not listening"));

    // The failed deploy left nothing behind
    let resp = http_request(port, "GET", "/api/list/hello", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));

    // Unknown function / version -> 404
    let resp = http_request(port, "POST", "/api/delete/nope", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));

    let resp = http_request(
        port,
        "POST",
        "/api/rollback/nope",
        Some(r#"{"version":"v1"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));

    let resp = http_request(port, "POST", "/api/stop/nope", Some(r#"{"version":"v1"}"#))
        .await
        .unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));

    // Listing a loaded function works and shows the suspended state
    let resp = http_request(port, "GET", "/api/list/listed", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains(r#""funcName":"listed""#));
    assert!(resp.contains(r#""status":"suspended""#));

    // Stopping a suspended version is a no-op success
    let resp = http_request(
        port,
        "POST",
        "/api/stop/listed",
        Some(r#"{"version":"v1"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains("stopped successfully"));

    // Deleting a version works and the function disappears with it
    let resp = http_request(
        port,
        "POST",
        "/api/delete/listed/version",
        Some(r#"{"version":"v1"}"#),
    )
    .await
    .unwrap();
    assert!(resp.starts_with("HTTP/1.1 200"));
    assert!(resp.contains("deleted successfully"));

    let resp = http_request(port, "GET", "/api/list/listed", None).await.unwrap();
    assert!(resp.starts_with("HTTP/1.1 404"));
}

#[tokio::test]
async fn test_config_defaults_match_service_expectations() {
    let config = Config::default();
    assert_eq!(config.server.api_port, 8081);
    assert_eq!(config.server.proxy_port, 80);
    assert_eq!(config.startup_timeout(), Duration::from_secs(5));
    assert_eq!(config.idle_threshold(), Duration::from_secs(300));
}
