use funcgate::api::{ApiServer, PKG_NAME, VERSION};
use funcgate::config::Config;
use funcgate::db::Database;
use funcgate::pool::{PoolConfig, UpstreamPool};
use funcgate::proxy::ProxyServer;
use funcgate::registry::{Registry, RegistrySettings};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("funcgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration: optional TOML file, env overrides either way
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        })?,
        None => Config::from_env(),
    };

    let storage_dir = config.storage_dir();
    std::fs::create_dir_all(&storage_dir)?;

    print_startup_banner(&config);

    // Open the store and reconstruct the registry
    let db = Database::open(storage_dir.join("funcgate.db"))?;
    let registry = Arc::new(Registry::new(db, RegistrySettings::from_config(&config)));

    // Load errors leave the affected records out but never prevent startup.
    match registry.load_from_store().await {
        Ok(count) => info!(count, storage = %storage_dir.display(), "Registry loaded"),
        Err(e) => warn!(error = %e, "Failed to load registry from store"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Control API server
    let api_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.api_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid API bind address: {}", e))?;
    let api_server = Arc::new(ApiServer::new(
        api_addr,
        Arc::clone(&registry),
        shutdown_rx.clone(),
    ));
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "Control API server error");
        }
    });

    // Proxy server
    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.proxy_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid proxy bind address: {}", e))?;
    let pool = Arc::new(UpstreamPool::new(PoolConfig::default()));
    let proxy_server = ProxyServer::new(
        proxy_addr,
        Arc::clone(&registry),
        pool,
        config.request_timeout(),
        shutdown_rx.clone(),
    );
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Idle checker
    let idle_registry = Arc::clone(&registry);
    let idle_interval = config.idle_check_interval();
    let idle_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        idle_check_loop(idle_registry, idle_interval, idle_shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown and stop all sandboxes
    let _ = shutdown_tx.send(true);

    info!("Stopping all sandboxes...");
    registry.shutdown().await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = api_handle.await;
        let _ = proxy_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn idle_check_loop(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                registry.suspend_idle().await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting control plane");
    info!(
        bind = %config.server.bind,
        api_port = config.server.api_port,
        proxy_port = config.server.proxy_port,
        "Server configuration"
    );
    info!(
        sandbox_binary = %config.sandbox.binary,
        storage_dir = %config.storage_dir().display(),
        startup_timeout_ms = config.sandbox.startup_timeout_ms,
        "Sandbox settings"
    );
    info!(
        idle_threshold_secs = config.idle.threshold_secs,
        check_interval_secs = config.idle.check_interval_secs,
        suspend_latest = config.idle.suspend_latest,
        "Idle checker settings"
    );
}
