//! Function registry and lifecycle engine
//!
//! The `Registry` is an owned value constructed at startup and shared
//! (behind `Arc`) between the control API, the proxy and the idle checker.
//! One `tokio::sync::RwLock` serializes every lifecycle transition; it is
//! deliberately held across sandbox spawn and the readiness probe, so
//! operations on the same registry are totally ordered. Resolver lookups
//! take the read lock; request forwarding happens outside any lock.

use crate::config::Config;
use crate::db::{Database, StoredFunction};
use crate::domains;
use crate::error::{Error, Result};
use crate::index::{FunctionRecord, FunctionStatus, Runtime, VersionIndex};
use crate::ports;
use crate::process::Supervisor;
use crate::template;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Settings the engine needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub storage_dir: PathBuf,
    pub sandbox_bin: String,
    pub startup_timeout: Duration,
    pub probe_interval: Duration,
    pub shutdown_grace: Duration,
    pub idle_threshold: Duration,
    pub suspend_latest: bool,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            storage_dir: config.storage_dir(),
            sandbox_bin: config.sandbox.binary.clone(),
            startup_timeout: config.startup_timeout(),
            probe_interval: config.probe_interval(),
            shutdown_grace: config.shutdown_grace(),
            idle_threshold: config.idle_threshold(),
            suspend_latest: config.idle.suspend_latest,
        }
    }
}

/// Deploy parameters, validated by the engine.
#[derive(Debug)]
pub struct DeployIntent {
    pub name: String,
    pub version: Option<String>,
    pub alias: Option<String>,
    pub runtime: String,
    pub code: String,
    pub env: HashMap<String, String>,
}

/// Outcome of a successful deploy.
#[derive(Debug, Serialize)]
pub struct Deployed {
    pub name: String,
    pub version: String,
    pub alias: Option<String>,
    pub subdomain: String,
    pub access_url: String,
}

/// Outcome of a successful rollback.
#[derive(Debug, Serialize)]
pub struct RolledBack {
    pub name: String,
    pub version: String,
    pub alias: Option<String>,
    pub access_url: String,
}

/// Snapshot of one version for listings.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: String,
    pub alias: Option<String>,
    pub subdomain: String,
    pub status: FunctionStatus,
    pub port: u16,
    pub pid: u32,
}

/// Snapshot handed to the proxy by the resolver.
#[derive(Debug, Clone)]
pub struct RouteTarget {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub running: bool,
}

struct RegistryState {
    index: VersionIndex,
    /// Child handles, keyed like the version map. The supervisor is the
    /// only signal sender; this table just owns the handles for waiting.
    children: HashMap<(String, String), Child>,
}

pub struct Registry {
    state: RwLock<RegistryState>,
    db: Database,
    supervisor: Supervisor,
    settings: RegistrySettings,
    started: Instant,
}

impl Registry {
    pub fn new(db: Database, settings: RegistrySettings) -> Self {
        let supervisor = Supervisor::new(
            settings.sandbox_bin.clone(),
            settings.startup_timeout,
            settings.probe_interval,
            settings.shutdown_grace,
        );
        Self {
            state: RwLock::new(RegistryState {
                index: VersionIndex::default(),
                children: HashMap::new(),
            }),
            db,
            supervisor,
            settings,
            started: Instant::now(),
        }
    }

    /// Millis on the registry's monotonic clock (for `last_accessed`).
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Sortable row timestamp; millisecond precision keeps the latest fold
    /// stable across quick successive deploys.
    fn timestamp() -> String {
        Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
    }

    // ==================== Deploy ====================

    pub async fn deploy(&self, intent: DeployIntent) -> Result<Deployed> {
        domains::validate_name(&intent.name)?;
        let runtime = Runtime::parse(&intent.runtime)?;

        let version = match intent.version.as_deref() {
            Some(v) if !v.is_empty() => {
                domains::validate_version(v)?;
                v.to_string()
            }
            // Timestamp-derived: 14 characters, second precision.
            _ => Utc::now().format("%Y%m%d%H%M%S").to_string(),
        };
        let alias = match intent.alias.as_deref() {
            Some(a) if !a.is_empty() => {
                domains::validate_alias(a)?;
                Some(a.to_string())
            }
            _ => None,
        };

        let mut state = self.state.write().await;

        // Versions are immutable: a byte-identical re-deploy is idempotent,
        // anything else conflicts.
        if let Some(existing) = state.index.get(&intent.name, &version) {
            if existing.code == intent.code
                && existing.env == intent.env
                && existing.alias == alias
            {
                return self
                    .redeploy_identical(&mut state, &intent.name, &version, alias)
                    .await;
            }
            return Err(Error::AlreadyExists(format!(
                "version '{}' of function '{}' already exists with different code, env or alias",
                version, intent.name
            )));
        }

        // Start the new version before touching the index; previous versions
        // keep serving and stay addressable while this blocks.
        let port = ports::alloc_port()?;
        let artifacts = template::write_artifacts(
            &self.settings.storage_dir,
            &intent.name,
            &version,
            runtime.ext(),
            &intent.code,
            &intent.env,
            port,
        )?;
        let sandbox = self
            .supervisor
            .start(&intent.name, &version, &artifacts, port)
            .await?;

        let mut record = FunctionRecord::new(
            intent.name.clone(),
            version.clone(),
            alias.clone(),
            runtime,
            intent.code,
            intent.env,
            artifacts,
            self.now_ms(),
        );
        record.status = FunctionStatus::Running;
        record.pid = sandbox.pid;
        record.port = sandbox.port;
        record.updated_at = Self::timestamp();

        if let Err(e) = self.db.upsert(&stored_from(&record)) {
            // The store is authoritative; a version that cannot be persisted
            // must not serve. Kill the child and fail the deploy.
            error!(name = %intent.name, version = %version, error = %e,
                   "Persist failed after start, killing sandbox");
            let mut child = sandbox.child;
            let _ = self
                .supervisor
                .stop(&intent.name, &version, &mut child)
                .await;
            return Err(e);
        }

        let subdomain = record.subdomain.clone();
        let displaced = state.index.register(record);
        state
            .children
            .insert((intent.name.clone(), version.clone()), sandbox.child);

        if let Some(prev) = displaced {
            self.persist_record(&state.index, &intent.name, &prev);
        }

        info!(name = %intent.name, version = %version, subdomain = %subdomain, port, "Function deployed");
        Ok(Deployed {
            access_url: format!("http://{}", subdomain),
            name: intent.name,
            version,
            alias,
            subdomain,
        })
    }

    /// Idempotent path for a byte-identical re-deploy: make sure the version
    /// runs, bump its row, and re-apply the registration rules (latest
    /// tracks the most recent deploy).
    async fn redeploy_identical(
        &self,
        state: &mut RegistryState,
        name: &str,
        version: &str,
        alias: Option<String>,
    ) -> Result<Deployed> {
        debug!(name, version, "Identical re-deploy, treating as idempotent");
        self.start_sandbox_locked(state, name, version).await?;

        let ts = Self::timestamp();
        let stored = {
            let record = state
                .index
                .get_mut(name, version)
                .ok_or_else(|| Error::Internal("record vanished during re-deploy".into()))?;
            record.updated_at = ts;
            stored_from(record)
        };
        self.db.upsert(&stored)?;

        state.index.apply_rollback(name, version, alias.as_deref());

        let subdomain = domains::version_subdomain(name, version);
        Ok(Deployed {
            access_url: format!("http://{}", subdomain),
            name: name.to_string(),
            version: version.to_string(),
            alias,
            subdomain,
        })
    }

    // ==================== Rollback ====================

    pub async fn rollback(
        &self,
        name: &str,
        target_version: &str,
        alias: Option<String>,
    ) -> Result<RolledBack> {
        let alias = match alias.as_deref() {
            Some(a) if !a.is_empty() => {
                domains::validate_alias(a)?;
                Some(a.to_string())
            }
            _ => None,
        };

        let mut state = self.state.write().await;

        if !state.index.contains(name, target_version) {
            return Err(Error::NotFound(format!(
                "version '{}' of function '{}' not found",
                target_version, name
            )));
        }

        // The target must be live before traffic is pointed at it.
        self.start_sandbox_locked(&mut state, name, target_version)
            .await?;

        // Default the alias to whatever tag the target already carries.
        let effective_alias = alias.or_else(|| {
            state
                .index
                .get(name, target_version)
                .and_then(|r| r.alias.clone())
        });

        let displaced =
            state
                .index
                .apply_rollback(name, target_version, effective_alias.as_deref());

        // Persist the moved alias and the bumped row so the new latest and
        // alias assignments survive a restart.
        let stored = {
            let record = state
                .index
                .get_mut(name, target_version)
                .ok_or_else(|| Error::Internal("record vanished during rollback".into()))?;
            record.updated_at = Self::timestamp();
            stored_from(record)
        };
        self.db.upsert(&stored)?;
        if let Some(prev) = displaced {
            self.persist_record(&state.index, name, &prev);
        }

        info!(name, target_version, alias = ?effective_alias, "Rolled back");
        Ok(RolledBack {
            name: name.to_string(),
            version: target_version.to_string(),
            access_url: format!("http://{}", domains::version_subdomain(name, target_version)),
            alias: effective_alias,
        })
    }

    // ==================== Stop / Delete ====================

    /// Suspend one version. The entry stays addressable; the next request
    /// wakes it.
    pub async fn stop(&self, name: &str, version: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.index.contains(name, version) {
            return Err(Error::NotFound(format!(
                "version '{}' of function '{}' not found",
                version, name
            )));
        }
        self.stop_record_locked(&mut state, name, version).await
    }

    pub async fn delete_version(&self, name: &str, version: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.index.contains(name, version) {
            return Err(Error::NotFound(format!(
                "version '{}' of function '{}' not found",
                version, name
            )));
        }

        self.stop_record_locked(&mut state, name, version).await?;
        self.db.soft_delete_version(name, version)?;

        if let Some(removed) = state.index.remove_version(name, version) {
            template::remove_artifacts(&removed.record.artifacts);
            if let Some(next) = removed.new_latest {
                debug!(name, new_latest = %next, "Latest repointed after delete");
            }
        }

        info!(name, version, "Version deleted");
        Ok(())
    }

    pub async fn delete_function(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.index.has_function(name) {
            return Err(Error::NotFound(format!("function '{}' not found", name)));
        }

        let versions: Vec<String> = state
            .index
            .versions_of(name)
            .iter()
            .map(|r| r.version.clone())
            .collect();
        for version in &versions {
            if let Err(e) = self.stop_record_locked(&mut state, name, version).await {
                warn!(name, version = %version, error = %e, "Failed to stop version during delete");
            }
        }

        self.db.soft_delete_function(name)?;

        for record in state.index.remove_function(name) {
            template::remove_artifacts(&record.artifacts);
        }

        info!(name, versions = versions.len(), "Function deleted");
        Ok(())
    }

    // ==================== Resolve / Wake / Touch ====================

    /// Three-tier host resolution under the read lock.
    pub async fn resolve(&self, host: &str) -> Result<RouteTarget> {
        let state = self.state.read().await;
        let record = state
            .index
            .resolve(host)
            .ok_or_else(|| Error::NotFound(format!("no function for host '{}'", host)))?;
        Ok(RouteTarget {
            name: record.name.clone(),
            version: record.version.clone(),
            port: record.port,
            running: record.is_running(),
        })
    }

    /// Wake a version if needed and return its live port.
    pub async fn ensure_running(&self, name: &str, version: &str) -> Result<u16> {
        let mut state = self.state.write().await;
        match self.start_sandbox_locked(&mut state, name, version).await {
            Ok(port) => Ok(port),
            Err(e @ Error::NotFound(_)) => Err(e),
            Err(e) => Err(Error::WakeFailed(e.to_string())),
        }
    }

    /// Record proxy traffic for the idle checker. Read lock only; the
    /// timestamp itself is atomic.
    pub async fn touch(&self, name: &str, version: &str) {
        let state = self.state.read().await;
        if let Some(record) = state.index.get(name, version) {
            record.touch(self.now_ms());
        }
    }

    // ==================== Idle checker ====================

    /// Suspend running versions idle past the threshold. The latest version
    /// of each function is exempt unless configured otherwise.
    pub async fn suspend_idle(&self) {
        let threshold_ms = self.settings.idle_threshold.as_millis() as u64;
        let now = self.now_ms();

        let mut state = self.state.write().await;
        let stale: Vec<(String, String)> = state
            .index
            .records()
            .filter(|r| r.is_running())
            .filter(|r| {
                self.settings.suspend_latest
                    || state.index.latest_version(&r.name) != Some(r.version.as_str())
            })
            .filter(|r| now.saturating_sub(r.last_accessed_ms()) > threshold_ms)
            .map(|r| (r.name.clone(), r.version.clone()))
            .collect();

        for (name, version) in stale {
            info!(name = %name, version = %version, "Suspending idle version");
            if let Err(e) = self.stop_record_locked(&mut state, &name, &version).await {
                warn!(name = %name, version = %version, error = %e, "Failed to suspend idle version");
            }
        }
    }

    // ==================== Startup / Shutdown ====================

    /// Rebuild the registry from the store. Every record comes back
    /// suspended with pid and port cleared; the first request wakes it.
    pub async fn load_from_store(&self) -> Result<usize> {
        let rows = self.db.load_active()?;
        let mut state = self.state.write().await;

        let mut count = 0;
        // Rows arrive oldest-update first, so registering in order leaves
        // `latest` on the most recently updated version of each function.
        for row in rows {
            let runtime = match Runtime::parse(&row.runtime) {
                Ok(r) => r,
                Err(e) => {
                    warn!(name = %row.name, version = %row.version, error = %e,
                          "Skipping stored version with unknown runtime");
                    continue;
                }
            };
            let mut record = FunctionRecord::new(
                row.name,
                row.version,
                row.alias,
                runtime,
                row.code,
                row.env,
                row.artifacts,
                self.now_ms(),
            );
            record.created_at = row.created_at;
            record.updated_at = row.updated_at;
            state.index.register(record);
            count += 1;
        }

        info!(count, "Registry reconstructed from store");
        Ok(count)
    }

    /// Stop every running sandbox (process teardown on shutdown).
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        let keys: Vec<(String, String)> = state.children.keys().cloned().collect();
        for (name, version) in keys {
            if let Err(e) = self.stop_record_locked(&mut state, &name, &version).await {
                warn!(name = %name, version = %version, error = %e, "Failed to stop sandbox during shutdown");
            }
        }
        info!("All sandboxes stopped");
    }

    // ==================== Listings ====================

    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionInfo>> {
        let state = self.state.read().await;
        if !state.index.has_function(name) {
            return Err(Error::NotFound(format!("function '{}' not found", name)));
        }
        Ok(state
            .index
            .versions_of(name)
            .iter()
            .map(|r| VersionInfo {
                version: r.version.clone(),
                alias: r.alias.clone(),
                subdomain: r.subdomain.clone(),
                status: r.status,
                port: r.port,
                pid: r.pid,
            })
            .collect())
    }

    // ==================== Internals ====================

    /// Start the sandbox for an existing record unless it is already
    /// running. Returns the live port. On failure the record is left
    /// suspended and the index otherwise untouched.
    async fn start_sandbox_locked(
        &self,
        state: &mut RegistryState,
        name: &str,
        version: &str,
    ) -> Result<u16> {
        let (code, env, ext) = {
            let record = state.index.get(name, version).ok_or_else(|| {
                Error::NotFound(format!(
                    "version '{}' of function '{}' not found",
                    version, name
                ))
            })?;
            if record.is_running() {
                return Ok(record.port);
            }
            (record.code.clone(), record.env.clone(), record.runtime.ext())
        };

        let port = ports::alloc_port()?;
        // The port changed, so the config artifact must be rewritten.
        let artifacts = template::write_artifacts(
            &self.settings.storage_dir,
            name,
            version,
            ext,
            &code,
            &env,
            port,
        )?;

        match self.supervisor.start(name, version, &artifacts, port).await {
            Ok(sandbox) => {
                let now = self.now_ms();
                if let Some(record) = state.index.get_mut(name, version) {
                    record.status = FunctionStatus::Running;
                    record.pid = sandbox.pid;
                    record.port = sandbox.port;
                    record.artifacts = artifacts;
                    record.touch(now);
                }
                state
                    .children
                    .insert((name.to_string(), version.to_string()), sandbox.child);
                info!(name, version, port, pid = sandbox.pid, "Sandbox started");
                Ok(port)
            }
            Err(e) => {
                if let Some(record) = state.index.get_mut(name, version) {
                    record.status = FunctionStatus::Suspended;
                    record.pid = 0;
                    record.port = 0;
                }
                warn!(name, version, error = %e, "Sandbox start failed");
                Err(e)
            }
        }
    }

    /// Stop a record's sandbox and mark it suspended. No index entries are
    /// removed.
    async fn stop_record_locked(
        &self,
        state: &mut RegistryState,
        name: &str,
        version: &str,
    ) -> Result<()> {
        let key = (name.to_string(), version.to_string());

        let stop_result = match state.children.remove(&key) {
            Some(mut child) => self.supervisor.stop(name, version, &mut child).await,
            // No live process: stopping is a no-op.
            None => Ok(()),
        };

        if let Some(record) = state.index.get_mut(name, version) {
            record.status = FunctionStatus::Suspended;
            record.pid = 0;
            record.port = 0;
        }

        stop_result
    }

    /// Best-effort persist of a record that changed as a side effect
    /// (an alias holder being displaced). The primary operation already
    /// persisted its own record; losing this write only costs an alias
    /// entry on the displaced side after a restart.
    fn persist_record(&self, index: &VersionIndex, name: &str, version: &str) {
        if let Some(record) = index.get(name, version) {
            if let Err(e) = self.db.upsert(&stored_from(record)) {
                warn!(name, version, error = %e, "Failed to persist displaced alias holder");
            }
        }
    }
}

fn stored_from(record: &FunctionRecord) -> StoredFunction {
    StoredFunction {
        name: record.name.clone(),
        version: record.version.clone(),
        subdomain: record.subdomain.clone(),
        alias: record.alias.clone(),
        runtime: record.runtime.as_str().to_string(),
        code: record.code.clone(),
        env: record.env.clone(),
        artifacts: record.artifacts.clone(),
        created_at: record.created_at.clone(),
        updated_at: record.updated_at.clone(),
    }
}
