//! Renders the workerd configuration artifact and code file for a version
//!
//! Filenames are keyed by `(name, version)` so a new deploy never overwrites
//! the artifacts of a version that is still serving traffic. The config must
//! reference the code file by relative path: workerd's `embed` resolves
//! relative to the config file itself.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Compatibility date pinned into every generated config.
const COMPATIBILITY_DATE: &str = "2024-05-01";

/// Filesystem artifacts belonging to one `(name, version)`.
///
/// Paths are static per version and persisted alongside the record; the
/// files themselves are rewritten on every start because the port changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxArtifacts {
    pub code_path: PathBuf,
    pub conf_path: PathBuf,
    pub log_path: PathBuf,
}

/// Compute the artifact paths for a version without touching the disk.
/// `ext` is the code file extension of the record's runtime.
pub fn artifact_paths(storage_dir: &Path, name: &str, version: &str, ext: &str) -> SandboxArtifacts {
    let key = format!("{}.{}", name, version);
    SandboxArtifacts {
        code_path: storage_dir.join(format!("{}.{}", key, ext)),
        conf_path: storage_dir.join(format!("{}.capnp", key)),
        log_path: storage_dir.join(format!("{}.log", key)),
    }
}

/// Write the code file and workerd config for a version, bound to `port`.
#[allow(clippy::too_many_arguments)]
pub fn write_artifacts(
    storage_dir: &Path,
    name: &str,
    version: &str,
    ext: &str,
    code: &str,
    env: &HashMap<String, String>,
    port: u16,
) -> Result<SandboxArtifacts> {
    let artifacts = artifact_paths(storage_dir, name, version, ext);

    std::fs::write(&artifacts.code_path, code)
        .map_err(|e| Error::Internal(format!("write code file: {}", e)))?;

    let code_file = artifacts
        .code_path
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or_else(|| Error::Internal("invalid code file name".into()))?;

    let conf = render_config(name, code_file, env, port);
    std::fs::write(&artifacts.conf_path, conf)
        .map_err(|e| Error::Internal(format!("write config file: {}", e)))?;

    Ok(artifacts)
}

/// Best-effort removal of a version's artifacts (on delete).
pub fn remove_artifacts(artifacts: &SandboxArtifacts) {
    for path in [
        &artifacts.code_path,
        &artifacts.conf_path,
        &artifacts.log_path,
    ] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            }
        }
    }
}

/// Render the workerd Cap'n Proto config: one service loading the code file
/// and one HTTP socket on the loopback port.
fn render_config(name: &str, code_file: &str, env: &HashMap<String, String>, port: u16) -> String {
    let bindings = render_bindings(env);
    format!(
        r#"using Workerd = import "/workerd/workerd.capnp";

const config :Workerd.Config = (
  services = [
    (
      name = "{name}",
      worker = (
        serviceWorkerScript = embed "{code_file}",
        compatibilityDate = "{date}"{bindings}
      )
    )
  ],
  sockets = [
    (
      name = "http",
      address = "127.0.0.1:{port}",
      http = (),
      service = "{name}"
    )
  ]
);
"#,
        name = escape(name),
        code_file = escape(code_file),
        date = COMPATIBILITY_DATE,
        bindings = bindings,
        port = port,
    )
}

fn render_bindings(env: &HashMap<String, String>) -> String {
    if env.is_empty() {
        return String::new();
    }
    // Deterministic output keeps configs diffable across restarts.
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let entries: Vec<String> = keys
        .iter()
        .map(|k| format!(r#"(name = "{}", text = "{}")"#, escape(k), escape(&env[*k])))
        .collect();
    format!(
        ",\n        bindings = [\n          {}\n        ]",
        entries.join(",\n          ")
    )
}

/// Escape a value for a Cap'n Proto string literal.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_paths_keyed_by_name_and_version() {
        let dir = PathBuf::from("/tmp/storage");
        let v1 = artifact_paths(&dir, "hello", "v1", "js");
        let v2 = artifact_paths(&dir, "hello", "v2", "js");

        assert_eq!(v1.code_path, dir.join("hello.v1.js"));
        assert_eq!(v1.conf_path, dir.join("hello.v1.capnp"));
        assert_eq!(v1.log_path, dir.join("hello.v1.log"));
        assert_ne!(v1.code_path, v2.code_path);
        assert_ne!(v1.conf_path, v2.conf_path);
    }

    #[test]
    fn test_render_config_embeds_relative_code_file() {
        let conf = render_config("hello", "hello.v1.js", &HashMap::new(), 41234);

        assert!(conf.contains(r#"serviceWorkerScript = embed "hello.v1.js""#));
        assert!(conf.contains(r#"address = "127.0.0.1:41234""#));
        assert!(conf.contains(r#"compatibilityDate = "2024-05-01""#));
        assert!(conf.contains(r#"service = "hello""#));
        // No absolute path may leak into the embed.
        assert!(!conf.contains("embed \"/"));
    }

    #[test]
    fn test_render_config_env_bindings() {
        let mut env = HashMap::new();
        env.insert("APP_ENV".to_string(), "production".to_string());
        env.insert("GREETING".to_string(), "say \"hi\"".to_string());

        let conf = render_config("envTest", "envTest.v1.js", &env, 5000);

        assert!(conf.contains(r#"(name = "APP_ENV", text = "production")"#));
        assert!(conf.contains(r#"(name = "GREETING", text = "say \"hi\"")"#));
        // Sorted deterministically.
        let app = conf.find("APP_ENV").unwrap();
        let greeting = conf.find("GREETING").unwrap();
        assert!(app < greeting);
    }

    #[test]
    fn test_render_config_no_bindings_section_when_env_empty() {
        let conf = render_config("hello", "hello.v1.js", &HashMap::new(), 1);
        assert!(!conf.contains("bindings"));
    }

    #[test]
    fn test_write_artifacts_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "value".to_string());

        let artifacts = write_artifacts(
            dir.path(),
            "hello",
            "v1",
            "js",
            "export default { fetch() { return new Response('v1'); } }",
            &env,
            40000,
        )
        .unwrap();

        let code = std::fs::read_to_string(&artifacts.code_path).unwrap();
        assert!(code.contains("Response('v1')"));

        let conf = std::fs::read_to_string(&artifacts.conf_path).unwrap();
        assert!(conf.contains("127.0.0.1:40000"));
        assert!(conf.contains(r#"embed "hello.v1.js""#));
    }

    #[test]
    fn test_remove_artifacts_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let artifacts =
            write_artifacts(dir.path(), "gone", "v1", "js", "//", &HashMap::new(), 1).unwrap();

        remove_artifacts(&artifacts);
        assert!(!artifacts.code_path.exists());
        assert!(!artifacts.conf_path.exists());

        // A second removal of missing files must not panic.
        remove_artifacts(&artifacts);
    }
}
