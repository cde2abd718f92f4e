//! Migration engine - ordered, versioned schema scripts
//!
//! Scripts register before the store loads and apply in registration order.
//! The count of successfully applied scripts persists as the applied
//! version in the store's metadata table. Each script runs inside its own
//! immediate transaction together with the version bump, so a failing
//! script rolls back completely while everything applied before it stays
//! applied.

use crate::gateway::Gateway;
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tracing::debug;

/// Reserved key/value metadata table
pub const METADATA_TABLE: &str = "rowkit_metadata";

/// Metadata key holding the applied migration version
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One registered schema script
#[derive(Debug, Clone)]
pub struct MigrationScript {
    pub name: String,
    pub sql: String,
}

/// Ordered list of schema scripts plus the loaded/unloaded state machine
pub struct Migrator {
    scripts: Vec<MigrationScript>,
    loaded: bool,
}

impl Migrator {
    pub fn new() -> Self {
        Self { scripts: Vec::new(), loaded: false }
    }

    /// Append a script. Only valid before the store loads.
    pub fn register(&mut self, name: impl Into<String>, sql: impl Into<String>) -> Result<()> {
        if self.loaded {
            return Err(Error::state("cannot register migrations after loading"));
        }
        self.scripts.push(MigrationScript { name: name.into(), sql: sql.into() });
        Ok(())
    }

    /// Append a script read from a file, named after the file
    pub fn register_file(&mut self, path: &Path) -> Result<()> {
        let sql = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.register(name, sql)
    }

    /// True if any migrations have been registered
    pub fn migrations_enabled(&self) -> bool {
        !self.scripts.is_empty()
    }

    pub fn script_count(&self) -> usize {
        self.scripts.len()
    }

    /// True if fewer scripts have been applied than registered
    pub fn requires_migration(&self, gateway: &Gateway) -> Result<bool> {
        let applied = gateway.access(|conn| Self::applied_version(conn))?;
        Ok(applied < self.scripts.len())
    }

    /// Apply every pending script in order. Stops at the first failure,
    /// leaving the applied version at the last success; the failing
    /// script's own transaction fully rolls back.
    pub fn run_pending(&mut self, gateway: &Gateway) -> Result<()> {
        gateway.access(|conn| Self::ensure_metadata_table(conn))?;
        let applied = gateway.access(|conn| Self::applied_version(conn))?;

        for (index, script) in self.scripts.iter().enumerate().skip(applied) {
            gateway
                .access_with_transaction(|conn, _rollback| {
                    conn.execute_batch(&script.sql)?;
                    Self::set_applied_version(conn, index + 1)?;
                    Ok(())
                })
                .map_err(|cause| Error::Migration {
                    index,
                    name: script.name.clone(),
                    cause: Box::new(cause),
                })?;
            debug!(script = %script.name, version = index + 1, "applied migration");
        }

        self.loaded = true;
        Ok(())
    }

    /// Create the reserved metadata table if absent
    pub fn ensure_metadata_table(conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{METADATA_TABLE}\" (key TEXT PRIMARY KEY, value)"
            ),
            [],
        )?;
        Ok(())
    }

    /// Stored applied version, 0 if the metadata table or row is absent
    pub fn applied_version(conn: &Connection) -> Result<usize> {
        let table_exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [METADATA_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        if table_exists.is_none() {
            return Ok(0);
        }

        let version: Option<i64> = conn
            .query_row(
                &format!("SELECT value FROM \"{METADATA_TABLE}\" WHERE key = ?1"),
                [SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0).max(0) as usize)
    }

    fn set_applied_version(conn: &Connection, version: usize) -> Result<()> {
        conn.execute(
            &format!("INSERT OR REPLACE INTO \"{METADATA_TABLE}\" (key, value) VALUES (?1, ?2)"),
            params![SCHEMA_VERSION_KEY, version as i64],
        )?;
        Ok(())
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(gateway: &Gateway) -> usize {
        gateway.access(|conn| Migrator::applied_version(conn)).unwrap()
    }

    fn has_table(gateway: &Gateway, name: &str) -> bool {
        gateway
            .access(|conn| {
                let found: Option<String> = conn
                    .query_row(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [name],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(found.is_some())
            })
            .unwrap()
    }

    #[test]
    fn test_scripts_apply_in_order() {
        let gateway = Gateway::open_in_memory().unwrap();
        let mut migrator = Migrator::new();
        migrator.register("001", "CREATE TABLE people (name TEXT)").unwrap();
        migrator
            .register("002", "ALTER TABLE people ADD COLUMN age INTEGER")
            .unwrap();

        assert!(migrator.requires_migration(&gateway).unwrap());
        migrator.run_pending(&gateway).unwrap();

        assert_eq!(applied(&gateway), 2);
        assert!(has_table(&gateway, "people"));
        assert!(!migrator.requires_migration(&gateway).unwrap());
    }

    #[test]
    fn test_second_run_is_a_noop() {
        let gateway = Gateway::open_in_memory().unwrap();
        let mut migrator = Migrator::new();
        migrator.register("001", "CREATE TABLE people (name TEXT)").unwrap();

        migrator.run_pending(&gateway).unwrap();
        // A second run must not re-apply (CREATE TABLE would fail)
        migrator.run_pending(&gateway).unwrap();
        assert_eq!(applied(&gateway), 1);
    }

    #[test]
    fn test_failure_stops_sequence_and_keeps_earlier_scripts() {
        let gateway = Gateway::open_in_memory().unwrap();
        let mut migrator = Migrator::new();
        migrator.register("001", "CREATE TABLE a (n INTEGER)").unwrap();
        migrator
            .register("002", "INSERT INTO a (n) VALUES (1); THIS IS NOT SQL;")
            .unwrap();
        migrator.register("003", "CREATE TABLE c (n INTEGER)").unwrap();

        let err = migrator.run_pending(&gateway).unwrap_err();
        match err {
            Error::Migration { index, name, .. } => {
                assert_eq!(index, 1);
                assert_eq!(name, "002");
            }
            other => panic!("unexpected error: {other}"),
        }

        // First script stays applied, the failing one fully rolled back,
        // the third never ran.
        assert_eq!(applied(&gateway), 1);
        assert!(has_table(&gateway, "a"));
        assert!(!has_table(&gateway, "c"));
        let rows: i64 = gateway
            .access(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM a", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_retry_advances_from_last_success() {
        let gateway = Gateway::open_in_memory().unwrap();
        let mut broken = Migrator::new();
        broken.register("001", "CREATE TABLE a (n INTEGER)").unwrap();
        broken.register("002", "NOT SQL").unwrap();
        assert!(broken.run_pending(&gateway).is_err());
        assert_eq!(applied(&gateway), 1);

        let mut fixed = Migrator::new();
        fixed.register("001", "CREATE TABLE a (n INTEGER)").unwrap();
        fixed.register("002", "CREATE TABLE b (n INTEGER)").unwrap();
        fixed.register("003", "CREATE TABLE c (n INTEGER)").unwrap();
        fixed.run_pending(&gateway).unwrap();

        assert_eq!(applied(&gateway), 3);
        assert!(has_table(&gateway, "b"));
        assert!(has_table(&gateway, "c"));
    }

    #[test]
    fn test_register_after_load_fails() {
        let gateway = Gateway::open_in_memory().unwrap();
        let mut migrator = Migrator::new();
        migrator.register("001", "CREATE TABLE a (n INTEGER)").unwrap();
        migrator.run_pending(&gateway).unwrap();

        let err = migrator.register("002", "CREATE TABLE b (n INTEGER)").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_register_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001_people.sql");
        std::fs::write(&path, "CREATE TABLE people (name TEXT)").unwrap();

        let gateway = Gateway::open_in_memory().unwrap();
        let mut migrator = Migrator::new();
        migrator.register_file(&path).unwrap();
        assert!(migrator.migrations_enabled());
        migrator.run_pending(&gateway).unwrap();
        assert!(has_table(&gateway, "people"));
    }
}
