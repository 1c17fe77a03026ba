//! SQLite persistence for function versions
//!
//! Every non-deleted version is durably recorded so the registry can be
//! reconstructed after a restart. Deletes are soft: rows keep their history
//! under a `deleted_at` timestamp and are invisible to all normal reads.
//! Transient process state (pid, allocated port) is never persisted.

use crate::error::Result;
use crate::template::SandboxArtifacts;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Persisted subset of a function version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFunction {
    pub name: String,
    pub version: String,
    pub subdomain: String,
    pub alias: Option<String>,
    pub runtime: String,
    pub code: String,
    pub env: HashMap<String, String>,
    /// Static artifact paths; pid and port are transient and excluded.
    pub artifacts: SandboxArtifacts,
    pub created_at: String,
    pub updated_at: String,
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::error::Error::Persistence(e.to_string()))?;
        }

        let conn = Connection::open(path)?;

        // WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!(
                "Running migrations from v{} to v{}",
                current_version, SCHEMA_VERSION
            );
            if current_version < 1 {
                migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Upsert a version keyed by `(name, version)`.
    ///
    /// A re-deploy after delete resurrects the row (clears `deleted_at`).
    pub fn upsert(&self, func: &StoredFunction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO functions
                (name, version, subdomain, alias, runtime, code, env, sandbox, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(name, version) DO UPDATE SET
                subdomain = excluded.subdomain,
                alias = excluded.alias,
                runtime = excluded.runtime,
                code = excluded.code,
                env = excluded.env,
                sandbox = excluded.sandbox,
                updated_at = excluded.updated_at,
                deleted_at = NULL",
            params![
                func.name,
                func.version,
                func.subdomain,
                func.alias,
                func.runtime,
                func.code,
                serde_json::to_string(&func.env)?,
                serde_json::to_string(&func.artifacts)?,
                func.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get one non-deleted version (administrative reads use SQL directly).
    pub fn get(&self, name: &str, version: &str) -> Result<Option<StoredFunction>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, version, subdomain, alias, runtime, code, env, sandbox,
                        created_at, updated_at
                 FROM functions
                 WHERE name = ?1 AND version = ?2 AND deleted_at IS NULL",
                params![name, version],
                row_to_stored,
            )
            .optional()?;
        Ok(row)
    }

    /// Load every non-deleted version, oldest update first so callers can
    /// fold last-wins to find the latest version of each function.
    pub fn load_active(&self) -> Result<Vec<StoredFunction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, version, subdomain, alias, runtime, code, env, sandbox,
                    created_at, updated_at
             FROM functions
             WHERE deleted_at IS NULL
             ORDER BY updated_at ASC, id ASC",
        )?;

        let rows = stmt
            .query_map([], row_to_stored)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!(count = rows.len(), "Loaded function versions from database");
        Ok(rows)
    }

    /// Soft-delete one version. Returns whether a live row was affected.
    pub fn soft_delete_version(&self, name: &str, version: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE functions SET deleted_at = datetime('now')
             WHERE name = ?1 AND version = ?2 AND deleted_at IS NULL",
            params![name, version],
        )?;
        Ok(rows > 0)
    }

    /// Soft-delete every version of a function. Returns the affected count.
    pub fn soft_delete_function(&self, name: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE functions SET deleted_at = datetime('now')
             WHERE name = ?1 AND deleted_at IS NULL",
            params![name],
        )?;
        Ok(rows)
    }
}

/// Migration v1: initial schema
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Applying migration v1: initial schema");

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS functions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            subdomain TEXT NOT NULL,
            alias TEXT,
            runtime TEXT NOT NULL,
            code TEXT NOT NULL,
            env TEXT NOT NULL DEFAULT '{}',
            sandbox TEXT NOT NULL DEFAULT '{}',
            UNIQUE (name, version)
        );

        CREATE INDEX IF NOT EXISTS idx_functions_name ON functions(name);
        CREATE INDEX IF NOT EXISTS idx_functions_subdomain ON functions(subdomain);

        INSERT INTO schema_migrations (version) VALUES (1);
    "#,
    )?;

    Ok(())
}

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredFunction> {
    let env_json: String = row.get(6)?;
    let sandbox_json: String = row.get(7)?;
    Ok(StoredFunction {
        name: row.get(0)?,
        version: row.get(1)?,
        subdomain: row.get(2)?,
        alias: row.get(3)?,
        runtime: row.get(4)?,
        code: row.get(5)?,
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        artifacts: serde_json::from_str(&sandbox_json).unwrap_or_default(),
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}
