//! SQLite database for TestDeck state persistence
//!
//! A single connection behind a mutex, WAL journaling, and an append-only
//! migration ledger. Every schema change is a new `(version, name, sql)`
//! entry in `MIGRATIONS`; existing entries are never rewritten. Each version
//! is applied inside one transaction together with its ledger row, so a
//! partially applied migration cannot be recorded.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::time::now_ms;

/// One schema migration. Append-only: never edit a shipped entry.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE test_definitions (
                id TEXT PRIMARY KEY,
                test_key TEXT NOT NULL UNIQUE,
                folder_path TEXT NOT NULL,
                spec_path TEXT NOT NULL,
                meta TEXT NOT NULL,
                constants TEXT NOT NULL DEFAULT '{}',
                overrides TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE schedules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cron TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                environment TEXT NOT NULL,
                last_triggered_at INTEGER,
                selector TEXT NOT NULL,
                default_run_overrides TEXT,
                created_by_email TEXT,
                updated_by_email TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX idx_schedules_enabled ON schedules(enabled);

            CREATE TABLE runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                environment TEXT NOT NULL,
                schedule_id TEXT REFERENCES schedules(id) ON DELETE SET NULL,
                triggered_by_email TEXT,
                run_overrides TEXT,
                metadata TEXT,
                summary TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            );
            CREATE INDEX idx_runs_status ON runs(status);
            CREATE INDEX idx_runs_environment ON runs(environment);
            CREATE INDEX idx_runs_created_at ON runs(created_at);

            CREATE TABLE run_tests (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                test_id TEXT NOT NULL,
                test_key TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_ms INTEGER,
                error_message TEXT,
                artifacts TEXT,
                started_at INTEGER,
                finished_at INTEGER,
                UNIQUE(run_id, test_key)
            );
            CREATE INDEX idx_run_tests_run_id ON run_tests(run_id);
            CREATE INDEX idx_run_tests_status ON run_tests(status);

            CREATE TABLE settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "run_tests_test_key_index",
        // Flakiness and per-test stat queries aggregate by test_key across runs.
        sql: r#"
            CREATE INDEX idx_run_tests_test_key ON run_tests(test_key);
        "#,
    },
];

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path, applying pending migrations.
    ///
    /// A migration failure is fatal to the caller; startup must abort.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.migrate()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Expose the underlying connection for the store layer.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Apply all migrations newer than the ledger's high-water mark.
    fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            );
            "#,
        )?;

        let applied: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration.sql).map_err(|e| Error::Migration {
                version: migration.version,
                message: e.to_string(),
            })?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.version, migration.name, now_ms()],
            )?;
            tx.commit()?;
            info!(
                "Applied migration {} ({})",
                migration.version, migration.name
            );
        }

        debug!("Database schema up to date");
        Ok(())
    }

    /// Current schema version (0 when no migration has been applied)
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    // ========================================================================
    // Settings key-value store
    // ========================================================================

    /// Set a setting
    pub fn setting_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_ms()],
        )?;
        Ok(())
    }

    /// Get a setting by key
    pub fn setting_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }
}
