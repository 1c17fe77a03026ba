//! Configuration for the control plane
//!
//! Loaded from an optional TOML file (first CLI argument); every field has a
//! default, and the knobs the original deployment tooling sets are also
//! overridable through environment variables.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub idle: IdleConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for both servers (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Control API port (default: 8081)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Proxy port for subdomain traffic (default: 80)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Max time to wait for a sandbox response (default: 30s)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Sandbox binary; a bare name is resolved on PATH (default: workerd)
    #[serde(default = "default_sandbox_binary")]
    pub binary: String,

    /// Storage directory for the database and per-version artifacts
    /// (default: an OS-temp subpath)
    pub storage_dir: Option<PathBuf>,

    /// Readiness probe window in milliseconds (default: 5000)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Interval between readiness probe attempts in milliseconds (default: 100)
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Grace period between SIGTERM and SIGKILL in seconds (default: 10)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdleConfig {
    /// Inactivity threshold before a version is suspended (default: 300s)
    #[serde(default = "default_idle_threshold")]
    pub threshold_secs: u64,

    /// Idle checker interval (default: 30s)
    #[serde(default = "default_idle_interval")]
    pub check_interval_secs: u64,

    /// Also suspend the latest version of each function (default: false,
    /// keeping the primary surface warm)
    #[serde(default)]
    pub suspend_latest: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            api_port: default_api_port(),
            proxy_port: default_proxy_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            binary: default_sandbox_binary(),
            storage_dir: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_secs: default_idle_threshold(),
            check_interval_secs: default_idle_interval(),
            suspend_latest: false,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8081
}

fn default_proxy_port() -> u16 {
    80
}

fn default_request_timeout() -> u64 {
    30
}

fn default_sandbox_binary() -> String {
    "workerd".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_probe_interval_ms() -> u64 {
    100
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_idle_threshold() -> u64 {
    300
}

fn default_idle_interval() -> u64 {
    30
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bin) = std::env::var("WORKERD_BIN") {
            if !bin.is_empty() {
                self.sandbox.binary = bin;
            }
        }
        if let Some(port) = env_u64("API_PORT") {
            self.server.api_port = port as u16;
        }
        if let Some(port) = env_u64("PROXY_PORT") {
            self.server.proxy_port = port as u16;
        }
        if let Ok(dir) = std::env::var("STORAGE_DIR") {
            if !dir.is_empty() {
                self.sandbox.storage_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(secs) = env_u64("IDLE_THRESHOLD_SECS") {
            self.idle.threshold_secs = secs;
        }
        if let Some(secs) = env_u64("IDLE_CHECK_INTERVAL_SECS") {
            self.idle.check_interval_secs = secs;
        }
    }

    /// Effective storage directory.
    pub fn storage_dir(&self) -> PathBuf {
        self.sandbox
            .storage_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("funcgate-storage"))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.sandbox.startup_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.sandbox.probe_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.sandbox.shutdown_grace_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle.threshold_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.api_port, 8081);
        assert_eq!(config.server.proxy_port, 80);
        assert_eq!(config.sandbox.binary, "workerd");
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert_eq!(config.probe_interval(), Duration::from_millis(100));
        assert_eq!(config.idle_threshold(), Duration::from_secs(300));
        assert_eq!(config.idle_check_interval(), Duration::from_secs(30));
        assert!(!config.idle.suspend_latest);
        assert!(config
            .storage_dir()
            .ends_with("funcgate-storage"));
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
api_port = 9081
proxy_port = 8080
request_timeout_secs = 10

[sandbox]
binary = "/opt/workerd/bin/workerd"
storage_dir = "/var/lib/funcgate"
startup_timeout_ms = 2000
probe_interval_ms = 50
shutdown_grace_secs = 3

[idle]
threshold_secs = 60
check_interval_secs = 5
suspend_latest = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.api_port, 9081);
        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.sandbox.binary, "/opt/workerd/bin/workerd");
        assert_eq!(config.storage_dir(), PathBuf::from("/var/lib/funcgate"));
        assert_eq!(config.startup_timeout(), Duration::from_secs(2));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(3));
        assert_eq!(config.idle_threshold(), Duration::from_secs(60));
        assert!(config.idle.suspend_latest);
    }

    #[test]
    fn test_parse_partial_config_keeps_defaults() {
        let toml = r#"
[server]
proxy_port = 8080
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.proxy_port, 8080);
        assert_eq!(config.server.api_port, 8081);
        assert_eq!(config.sandbox.binary, "workerd");
    }
}
