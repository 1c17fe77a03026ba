//! In-memory version and alias index
//!
//! The index owns every live function record and the four maps that make a
//! record addressable:
//!
//! - `versions[(name, version)]` - canonical store
//! - `latest[name]` - version most recently deployed (or rolled back to)
//! - `aliases[(name, alias)]` - one alias points at exactly one version;
//!   the reserved alias `latest` is maintained automatically
//! - `by_subdomain[subdomain]` - version-, alias-, latest- and bare-function
//!   flavored subdomains, each resolving to a `(name, version)` pair
//!
//! All mutation happens while the registry holds its write lock; the index
//! itself is a plain data structure.

use crate::domains::{self, LATEST_ALIAS};
use crate::error::{Error, Result};
use crate::template::SandboxArtifacts;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supported sandbox runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Js,
}

impl Runtime {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "js" => Ok(Runtime::Js),
            other => Err(Error::InvalidInput(format!(
                "unsupported runtime '{}' (supported: js)",
                other
            ))),
        }
    }

    /// Code file extension for this runtime.
    pub fn ext(&self) -> &'static str {
        match self {
            Runtime::Js => "js",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Js => "js",
        }
    }
}

/// Lifecycle state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Sandbox process is live and addressable.
    Running,
    /// No process; woken on the next request.
    Suspended,
    /// Transitional only; never the resting state of an indexed record.
    Failed,
}

/// One deployed version of a function.
#[derive(Debug)]
pub struct FunctionRecord {
    pub name: String,
    pub version: String,
    pub alias: Option<String>,
    pub subdomain: String,
    pub runtime: Runtime,
    pub code: String,
    pub env: HashMap<String, String>,
    pub status: FunctionStatus,
    /// Transient: pid of the sandbox process, 0 when suspended.
    pub pid: u32,
    /// Transient: loopback port of the sandbox, 0 when suspended.
    pub port: u16,
    pub artifacts: SandboxArtifacts,
    /// Millis on the registry's monotonic clock; atomic so the proxy can
    /// touch it under the read lock.
    last_accessed: AtomicU64,
    pub created_at: String,
    pub updated_at: String,
}

impl FunctionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        version: String,
        alias: Option<String>,
        runtime: Runtime,
        code: String,
        env: HashMap<String, String>,
        artifacts: SandboxArtifacts,
        now_ms: u64,
    ) -> Self {
        let subdomain = domains::version_subdomain(&name, &version);
        Self {
            name,
            version,
            alias,
            subdomain,
            runtime,
            code,
            env,
            status: FunctionStatus::Suspended,
            pid: 0,
            port: 0,
            artifacts,
            last_accessed: AtomicU64::new(now_ms),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_accessed.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_accessed_ms(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.status == FunctionStatus::Running
    }
}

/// A removed version plus the bookkeeping the engine must persist.
pub struct RemovedVersion {
    pub record: FunctionRecord,
    /// New latest version of the function, when the removal repointed it.
    pub new_latest: Option<String>,
}

#[derive(Default)]
pub struct VersionIndex {
    versions: HashMap<(String, String), FunctionRecord>,
    latest: HashMap<String, String>,
    aliases: HashMap<(String, String), String>,
    by_subdomain: HashMap<String, (String, String)>,
}

impl VersionIndex {
    pub fn get(&self, name: &str, version: &str) -> Option<&FunctionRecord> {
        self.versions.get(&(name.to_string(), version.to_string()))
    }

    pub fn get_mut(&mut self, name: &str, version: &str) -> Option<&mut FunctionRecord> {
        self.versions.get_mut(&(name.to_string(), version.to_string()))
    }

    pub fn contains(&self, name: &str, version: &str) -> bool {
        self.get(name, version).is_some()
    }

    pub fn latest_version(&self, name: &str) -> Option<&str> {
        self.latest.get(name).map(String::as_str)
    }

    pub fn alias_target(&self, name: &str, alias: &str) -> Option<&str> {
        self.aliases
            .get(&(name.to_string(), alias.to_string()))
            .map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.versions.values()
    }

    /// All versions of one function, sorted by version tag.
    pub fn versions_of(&self, name: &str) -> Vec<&FunctionRecord> {
        let mut records: Vec<&FunctionRecord> = self
            .versions
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, r)| r)
            .collect();
        records.sort_by(|a, b| a.version.cmp(&b.version));
        records
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.latest.contains_key(name)
    }

    /// Register a deployed record.
    ///
    /// Applies the subdomain rules: version subdomain, unconditional latest
    /// repoint (latest tracks the most recent deploy), latest-alias and
    /// bare-function subdomains, then the user alias. When the user alias
    /// previously pointed at a different version, that holder's stored alias
    /// is cleared and its version returned so the caller can persist it.
    pub fn register(&mut self, record: FunctionRecord) -> Option<String> {
        let name = record.name.clone();
        let version = record.version.clone();
        let key = (name.clone(), version.clone());

        self.by_subdomain.insert(record.subdomain.clone(), key.clone());

        self.latest.insert(name.clone(), version.clone());
        self.aliases
            .insert((name.clone(), LATEST_ALIAS.to_string()), version.clone());
        self.by_subdomain
            .insert(domains::alias_subdomain(&name, LATEST_ALIAS), key.clone());
        self.by_subdomain
            .insert(domains::function_subdomain(&name), key.clone());

        let mut displaced = None;
        if let Some(alias) = record.alias.clone().filter(|a| a != LATEST_ALIAS) {
            let alias_key = (name.clone(), alias.clone());
            if let Some(prev) = self.aliases.get(&alias_key).cloned() {
                if prev != version {
                    if let Some(prev_rec) = self.get_mut(&name, &prev) {
                        prev_rec.alias = None;
                    }
                    displaced = Some(prev);
                }
            }
            self.aliases.insert(alias_key, version.clone());
            self.by_subdomain
                .insert(domains::alias_subdomain(&name, &alias), key.clone());
        }

        self.versions.insert(key, record);
        displaced
    }

    /// Move an alias and repoint `latest` to an existing target version.
    ///
    /// The caller has already verified the target exists and is running.
    /// Returns the version that previously held the alias, if any.
    pub fn apply_rollback(
        &mut self,
        name: &str,
        target_version: &str,
        alias: Option<&str>,
    ) -> Option<String> {
        let key = (name.to_string(), target_version.to_string());

        let mut displaced = None;
        if let Some(alias) = alias.filter(|a| *a != LATEST_ALIAS) {
            let alias_key = (name.to_string(), alias.to_string());
            if let Some(prev) = self.aliases.get(&alias_key).cloned() {
                if prev != target_version {
                    self.by_subdomain
                        .remove(&domains::alias_subdomain(name, alias));
                    if let Some(prev_rec) = self.get_mut(name, &prev) {
                        prev_rec.alias = None;
                    }
                    displaced = Some(prev);
                }
            }
            self.aliases.insert(alias_key, target_version.to_string());
            self.by_subdomain
                .insert(domains::alias_subdomain(name, alias), key.clone());
            if let Some(target) = self.get_mut(name, target_version) {
                target.alias = Some(alias.to_string());
            }
        }

        // Rollback reverses what `latest` tracks; this is the user-visible
        // effect.
        self.latest
            .insert(name.to_string(), target_version.to_string());
        self.aliases.insert(
            (name.to_string(), LATEST_ALIAS.to_string()),
            target_version.to_string(),
        );
        self.by_subdomain
            .insert(domains::alias_subdomain(name, LATEST_ALIAS), key.clone());
        self.by_subdomain
            .insert(domains::function_subdomain(name), key);

        displaced
    }

    /// Remove one version and every index entry referencing it.
    ///
    /// When the removed version was `latest`, latest repoints to the
    /// remaining version with the greatest `(updated_at, version)`; the
    /// function disappears entirely when no version remains.
    pub fn remove_version(&mut self, name: &str, version: &str) -> Option<RemovedVersion> {
        let key = (name.to_string(), version.to_string());
        let record = self.versions.remove(&key)?;

        self.by_subdomain.remove(&record.subdomain);

        let stale_aliases: Vec<String> = self
            .aliases
            .iter()
            .filter(|((n, _), v)| n == name && v.as_str() == version)
            .map(|((_, a), _)| a.clone())
            .collect();
        for alias in &stale_aliases {
            self.aliases.remove(&(name.to_string(), alias.clone()));
            self.by_subdomain
                .remove(&domains::alias_subdomain(name, alias));
        }

        let mut new_latest = None;
        if self.latest.get(name).map(String::as_str) == Some(version) {
            let candidate = self
                .versions
                .iter()
                .filter(|((n, _), _)| n == name)
                .max_by_key(|(_, r)| (r.updated_at.clone(), r.version.clone()))
                .map(|(_, r)| r.version.clone());

            match candidate {
                Some(next) => {
                    let next_key = (name.to_string(), next.clone());
                    self.latest.insert(name.to_string(), next.clone());
                    self.aliases
                        .insert((name.to_string(), LATEST_ALIAS.to_string()), next.clone());
                    self.by_subdomain.insert(
                        domains::alias_subdomain(name, LATEST_ALIAS),
                        next_key.clone(),
                    );
                    self.by_subdomain
                        .insert(domains::function_subdomain(name), next_key);
                    new_latest = Some(next);
                }
                None => {
                    self.latest.remove(name);
                    self.by_subdomain.remove(&domains::function_subdomain(name));
                }
            }
        }

        Some(RemovedVersion { record, new_latest })
    }

    /// Remove a whole function: every version, alias and subdomain.
    pub fn remove_function(&mut self, name: &str) -> Vec<FunctionRecord> {
        let keys: Vec<(String, String)> = self
            .versions
            .keys()
            .filter(|(n, _)| n == name)
            .cloned()
            .collect();

        let records: Vec<FunctionRecord> = keys
            .iter()
            .filter_map(|k| self.versions.remove(k))
            .collect();

        self.aliases.retain(|(n, _), _| n != name);
        self.latest.remove(name);
        self.by_subdomain.retain(|_, (n, _)| n != name);

        records
    }

    /// Three-tier host resolution: exact subdomain, then `(alias, name)`
    /// split through the alias map, then first-label-as-name through latest.
    pub fn resolve(&self, host: &str) -> Option<&FunctionRecord> {
        if let Some((name, version)) = self.by_subdomain.get(host) {
            return self.versions.get(&(name.clone(), version.clone()));
        }

        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() >= 2 {
            let (alias, name) = (labels[0], labels[1]);
            if let Some(version) = self.alias_target(name, alias) {
                let version = version.to_string();
                return self.get(name, &version);
            }
        }

        let name = labels[0];
        let latest = self.latest.get(name)?.clone();
        self.get(name, &latest)
    }

    /// Test/debug helper: verify the invariants of the map family.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for ((name, _alias), version) in &self.aliases {
            assert!(
                self.contains(name, version),
                "alias points at missing version {}:{}",
                name,
                version
            );
        }
        for (name, version) in &self.latest {
            assert!(
                self.contains(name, version),
                "latest points at missing version {}:{}",
                name,
                version
            );
        }
        for (sub, (name, version)) in &self.by_subdomain {
            assert!(
                self.contains(name, version),
                "subdomain {} points at missing version {}:{}",
                sub,
                name,
                version
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, version: &str, alias: Option<&str>) -> FunctionRecord {
        let mut rec = FunctionRecord::new(
            name.to_string(),
            version.to_string(),
            alias.map(String::from),
            Runtime::Js,
            format!("// {}", version),
            HashMap::new(),
            SandboxArtifacts::default(),
            0,
        );
        rec.updated_at = format!("2026-01-01 10:00:0{}.000", version.len());
        rec
    }

    fn resolve_version<'a>(idx: &'a VersionIndex, host: &str) -> Option<&'a str> {
        idx.resolve(host).map(|r| r.version.as_str())
    }

    #[test]
    fn test_register_creates_all_subdomain_flavors() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));

        assert_eq!(resolve_version(&idx, "v1.hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "latest.hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "hello.func.local"), Some("v1"));
        assert_eq!(idx.latest_version("hello"), Some("v1"));
        assert_eq!(idx.alias_target("hello", "latest"), Some("v1"));
        idx.assert_consistent();
    }

    #[test]
    fn test_latest_tracks_most_recent_deploy() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));
        idx.register(record("hello", "v2", None));

        assert_eq!(idx.latest_version("hello"), Some("v2"));
        assert_eq!(resolve_version(&idx, "hello.func.local"), Some("v2"));
        assert_eq!(resolve_version(&idx, "latest.hello.func.local"), Some("v2"));
        // Previous version keeps its own subdomain.
        assert_eq!(resolve_version(&idx, "v1.hello.func.local"), Some("v1"));
        idx.assert_consistent();
    }

    #[test]
    fn test_alias_registration_and_displacement() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", Some("test")));
        assert_eq!(resolve_version(&idx, "test.hello.func.local"), Some("v1"));

        let displaced = idx.register(record("hello", "v2", Some("test")));
        assert_eq!(displaced.as_deref(), Some("v1"));
        assert_eq!(resolve_version(&idx, "test.hello.func.local"), Some("v2"));
        assert_eq!(idx.alias_target("hello", "test"), Some("v2"));
        // Displaced holder's stored alias is cleared.
        assert_eq!(idx.get("hello", "v1").unwrap().alias, None);
        idx.assert_consistent();
    }

    #[test]
    fn test_rollback_moves_alias_and_latest() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));
        idx.register(record("hello", "v2", Some("test")));
        assert_eq!(idx.latest_version("hello"), Some("v2"));

        let displaced = idx.apply_rollback("hello", "v1", Some("test"));
        assert_eq!(displaced.as_deref(), Some("v2"));

        assert_eq!(idx.latest_version("hello"), Some("v1"));
        assert_eq!(resolve_version(&idx, "hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "latest.hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "test.hello.func.local"), Some("v1"));
        assert_eq!(idx.get("hello", "v1").unwrap().alias.as_deref(), Some("test"));
        assert_eq!(idx.get("hello", "v2").unwrap().alias, None);
        // Version subdomains are untouched.
        assert_eq!(resolve_version(&idx, "v2.hello.func.local"), Some("v2"));
        idx.assert_consistent();
    }

    #[test]
    fn test_rollback_without_alias_only_repoints_latest() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));
        idx.register(record("hello", "v2", None));

        let displaced = idx.apply_rollback("hello", "v1", None);
        assert_eq!(displaced, None);
        assert_eq!(idx.latest_version("hello"), Some("v1"));
        assert_eq!(resolve_version(&idx, "hello.func.local"), Some("v1"));
        idx.assert_consistent();
    }

    #[test]
    fn test_remove_version_repoints_latest() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));
        idx.register(record("hello", "v2", None));

        let removed = idx.remove_version("hello", "v2").unwrap();
        assert_eq!(removed.record.version, "v2");
        assert_eq!(removed.new_latest.as_deref(), Some("v1"));

        assert_eq!(idx.latest_version("hello"), Some("v1"));
        assert_eq!(resolve_version(&idx, "hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "latest.hello.func.local"), Some("v1"));
        assert_eq!(resolve_version(&idx, "v2.hello.func.local"), None);
        idx.assert_consistent();
    }

    #[test]
    fn test_remove_version_drops_aliases_pointing_at_it() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", Some("test")));
        idx.register(record("hello", "v2", None));

        idx.remove_version("hello", "v1").unwrap();
        assert_eq!(idx.alias_target("hello", "test"), None);
        assert_eq!(resolve_version(&idx, "test.hello.func.local"), None);
        assert_eq!(idx.latest_version("hello"), Some("v2"));
        idx.assert_consistent();
    }

    #[test]
    fn test_remove_last_version_removes_function() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));

        let removed = idx.remove_version("hello", "v1").unwrap();
        assert_eq!(removed.new_latest, None);

        assert!(!idx.has_function("hello"));
        assert!(idx.resolve("hello.func.local").is_none());
        assert!(idx.resolve("v1.hello.func.local").is_none());
        assert!(idx.resolve("latest.hello.func.local").is_none());
        idx.assert_consistent();
    }

    #[test]
    fn test_remove_missing_version_is_none() {
        let mut idx = VersionIndex::default();
        assert!(idx.remove_version("hello", "v1").is_none());
    }

    #[test]
    fn test_remove_function_clears_everything() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", Some("test")));
        idx.register(record("hello", "v2", None));
        idx.register(record("other", "v1", None));

        let removed = idx.remove_function("hello");
        assert_eq!(removed.len(), 2);

        assert!(!idx.has_function("hello"));
        assert!(idx.resolve("v1.hello.func.local").is_none());
        assert!(idx.resolve("test.hello.func.local").is_none());
        assert!(idx.resolve("hello.func.local").is_none());
        // The other function is untouched.
        assert_eq!(resolve_version(&idx, "other.func.local"), Some("v1"));
        idx.assert_consistent();
    }

    #[test]
    fn test_resolve_alias_tier_without_subdomain_entry() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));
        // Simulate an alias known to the alias map only.
        idx.aliases
            .insert(("hello".to_string(), "canary".to_string()), "v1".to_string());

        assert_eq!(resolve_version(&idx, "canary.hello.func.local"), Some("v1"));
    }

    #[test]
    fn test_resolve_bare_name_tier() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v1", None));

        // First label treated as the function name, even off-zone.
        assert_eq!(resolve_version(&idx, "hello"), Some("v1"));
        assert_eq!(resolve_version(&idx, "hello.example.com"), Some("v1"));
    }

    #[test]
    fn test_resolve_unknown_host() {
        let idx = VersionIndex::default();
        assert!(idx.resolve("nope.func.local").is_none());
    }

    #[test]
    fn test_versions_of_sorted() {
        let mut idx = VersionIndex::default();
        idx.register(record("hello", "v2", None));
        idx.register(record("hello", "v1", None));
        idx.register(record("other", "v9", None));

        let versions: Vec<&str> = idx
            .versions_of("hello")
            .iter()
            .map(|r| r.version.as_str())
            .collect();
        assert_eq!(versions, vec!["v1", "v2"]);
    }

    #[test]
    fn test_runtime_parse() {
        assert!(matches!(Runtime::parse("js"), Ok(Runtime::Js)));
        assert!(Runtime::parse("python").is_err());
        assert_eq!(Runtime::Js.ext(), "js");
    }
}
