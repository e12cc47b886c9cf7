//! SQLite persistence layer with migrations
//!
//! One pooled database holds all tenants. Handlers run database work inside
//! `tokio::task::spawn_blocking`; a connection is acquired from the pool in
//! the closure and released by RAII on every exit path.

use std::path::Path;
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;

use crate::config::DatabaseSection;
use crate::{Error, Result};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 50;

/// Database handle with migration support
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database at the configured path.
    pub fn open(config: &DatabaseSection) -> Result<Self> {
        let db_path = Path::new(&config.path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let busy_timeout = config.busy_timeout_ms;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                busy_timeout
            ))
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .map_err(|e| Error::database(format!("failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| Error::database(format!("failed to get connection: {}", e)))
    }

    /// Run `op` with bounded retry on connection-level errors.
    ///
    /// Only transient failures (busy/locked, pool exhaustion) are retried, at
    /// most three attempts with exponential backoff. Logical errors pass
    /// through untouched.
    pub fn with_retry<T>(&self, mut op: impl FnMut(&mut DbConnection) -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            let result = self.conn().and_then(|mut conn| op(&mut conn));
            match result {
                Err(err) if attempt + 1 < RETRY_ATTEMPTS && is_transient(&err) => {
                    attempt += 1;
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS << attempt);
                    tracing::warn!(attempt, error = %err, "transient database error, retrying");
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    /// Cheap connectivity probe for the health endpoint
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i64 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
                row.get(0)
            })
            .unwrap_or(0);

        for (index, migration) in MIGRATIONS.iter().enumerate() {
            let version = index as i64 + 1;
            if version > current_version {
                tracing::info!(version, "applying migration");
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    [version],
                )?;
            }
        }

        Ok(())
    }
}

/// Whether an error is worth retrying at the connection level
fn is_transient(err: &Error) -> bool {
    match err {
        Error::Database(msg) => {
            msg.contains("database is locked")
                || msg.contains("database table is locked")
                || msg.contains("failed to get connection")
                || msg.contains("timed out waiting for connection")
        }
        _ => false,
    }
}

/// Convert a rusqlite failure, preserving unique-constraint context
pub fn map_sqlite_error(err: rusqlite::Error, unique_hint: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(code, ref message) = err {
        if code.code == ErrorCode::ConstraintViolation {
            let detail = message.clone().unwrap_or_default();
            if detail.contains("external") {
                return Error::DuplicateExternalId(unique_hint.to_string());
            }
        }
    }
    Error::from(err)
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: initial schema
    r#"
    -- Registered clients and their HE/LSH configuration
    CREATE TABLE clients (
        client_id TEXT PRIMARY KEY,
        client_name TEXT NOT NULL,
        api_key_hash TEXT NOT NULL UNIQUE,
        he_scheme TEXT NOT NULL,
        poly_modulus_degree INTEGER NOT NULL,
        scale INTEGER NOT NULL,
        public_key BLOB NOT NULL,
        embedding_dim INTEGER NOT NULL,
        num_tables INTEGER NOT NULL,
        hash_size INTEGER NOT NULL,
        num_candidates INTEGER NOT NULL,
        max_embeddings INTEGER NOT NULL,
        total_embeddings INTEGER NOT NULL DEFAULT 0,
        total_searches INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_active_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1
    );

    -- Encrypted embeddings, append-mostly with soft delete
    CREATE TABLE embeddings (
        embedding_id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL REFERENCES clients(client_id) ON DELETE CASCADE,
        external_id TEXT,
        ciphertext BLOB NOT NULL,
        size_bytes INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        accessed_at TEXT NOT NULL,
        access_count INTEGER NOT NULL DEFAULT 0,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TEXT
    );

    CREATE UNIQUE INDEX idx_embeddings_external
        ON embeddings(client_id, external_id)
        WHERE external_id IS NOT NULL;
    CREATE INDEX idx_embeddings_client ON embeddings(client_id, is_deleted);

    -- Flexible per-embedding metadata (JSON)
    CREATE TABLE embedding_metadata (
        embedding_id TEXT PRIMARY KEY
            REFERENCES embeddings(embedding_id) ON DELETE CASCADE,
        metadata TEXT NOT NULL
    );

    -- LSH posting lists; the PK doubles as the probe index
    CREATE TABLE lsh_postings (
        client_id TEXT NOT NULL REFERENCES clients(client_id) ON DELETE CASCADE,
        table_index INTEGER NOT NULL,
        hash_value INTEGER NOT NULL,
        embedding_id TEXT NOT NULL
            REFERENCES embeddings(embedding_id) ON DELETE CASCADE,
        PRIMARY KEY (client_id, table_index, hash_value, embedding_id)
    ) WITHOUT ROWID;

    -- Search analytics
    CREATE TABLE search_log (
        search_id TEXT PRIMARY KEY,
        client_id TEXT NOT NULL REFERENCES clients(client_id) ON DELETE CASCADE,
        top_k INTEGER NOT NULL,
        rerank_candidates INTEGER NOT NULL,
        candidates_found INTEGER NOT NULL,
        candidates_checked INTEGER NOT NULL,
        results_returned INTEGER NOT NULL,
        lsh_time_ms INTEGER NOT NULL,
        he_compute_time_ms INTEGER NOT NULL,
        total_time_ms INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX idx_search_log_client ON search_log(client_id, created_at);
    "#,
];

#[cfg(test)]
pub(crate) fn test_database() -> (tempfile::TempDir, Database) {
    let dir = tempfile::TempDir::new().unwrap();
    let config = DatabaseSection {
        path: dir
            .path()
            .join("test.db")
            .to_str()
            .unwrap()
            .to_string(),
        ..Default::default()
    };
    let db = Database::open(&config).unwrap();
    (dir, db)
}
