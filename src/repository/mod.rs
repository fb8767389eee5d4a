//! Repository layer for database persistence.
//!
//! Connections are short-lived: each operation draws one from a bounded
//! pool, runs its statements, and drops it. Atomic multi-row operations
//! run under `BEGIN IMMEDIATE`.

mod company;
mod queue;
mod site;

pub use company::{ChunkDraft, CompanyRepository};
pub use queue::{QueueConfig, QueueRepository};
pub use site::SiteKnowledgeRepository;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored row carries unreadable json: {0}")]
    BadRowPayload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Timestamps are stored as RFC 3339 text. An unreadable value collapses
/// to the epoch instead of failing the whole row.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn parse_datetime_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().and_then(|s| s.parse().ok())
}

/// Collapse `QueryReturnedNoRows` into `None`; every other error surfaces.
pub fn optional_row<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        other => Ok(Some(other?)),
    }
}

/// Open a connection with settings tuned for concurrent workers.
pub fn connect(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL allows multiple readers alongside one writer; busy_timeout covers
    // writer contention between worker tasks.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        PRAGMA temp_store = MEMORY;
    "#,
    )?;

    Ok(conn)
}

/// Bounded sqlite pool. Connections are created on demand; the semaphore
/// caps how many are open at once across the process.
#[derive(Clone)]
pub struct SqlitePool {
    path: PathBuf,
    permits: Arc<Semaphore>,
}

impl SqlitePool {
    pub fn new(path: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            path: path.into(),
            permits: Arc::new(Semaphore::new(max_size.max(1))),
        }
    }

    /// Acquire a connection slot, then open the connection.
    pub async fn get(&self) -> Result<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        let conn = connect(&self.path)?;
        Ok(PooledConnection {
            conn,
            _permit: permit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A live connection holding its pool slot until dropped.
pub struct PooledConnection {
    conn: Connection,
    _permit: OwnedSemaphorePermit,
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Create all tables and indexes. Returns the tables present afterwards.
pub fn run_all_migrations(db_path: &Path) -> Result<Vec<String>> {
    let conn = connect(db_path)?;

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS search_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_key TEXT NOT NULL,
            query TEXT NOT NULL,
            hits TEXT NOT NULL,
            result_count INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_search_results_key
            ON search_results(company_key, id);

        CREATE TABLE IF NOT EXISTS discovery_results (
            company_key TEXT PRIMARY KEY,
            chosen_url TEXT,
            status TEXT NOT NULL,
            confidence REAL NOT NULL,
            reasoning TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scraped_chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_key TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_total INTEGER NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER NOT NULL,
            source_urls TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scraped_chunks_key
            ON scraped_chunks(company_key, chunk_index);

        CREATE TABLE IF NOT EXISTS company_profiles (
            company_key TEXT PRIMARY KEY,
            profile TEXT NOT NULL,
            company_name TEXT,
            industry TEXT,
            status TEXT NOT NULL,
            chunks_used INTEGER NOT NULL,
            chunks_total INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_discovery (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_key TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            available_at TEXT NOT NULL,
            locked_at TEXT,
            owner TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_discovery_ready
            ON queue_discovery(status, available_at, id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_discovery_active
            ON queue_discovery(company_key)
            WHERE status IN ('queued', 'processing');

        CREATE TABLE IF NOT EXISTS queue_profile (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            company_key TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            available_at TEXT NOT NULL,
            locked_at TEXT,
            owner TEXT,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_profile_ready
            ON queue_profile(status, available_at, id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_profile_active
            ON queue_profile(company_key)
            WHERE status IN ('queued', 'processing');

        CREATE TABLE IF NOT EXISTS site_knowledge (
            origin TEXT PRIMARY KEY,
            best_strategy TEXT,
            protection TEXT,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            last_success_at TEXT,
            updated_at TEXT NOT NULL
        );
    "#,
    )?;

    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_migrations_create_all_tables() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let tables = run_all_migrations(&db_path).unwrap();
        for expected in [
            "company_profiles",
            "discovery_results",
            "queue_discovery",
            "queue_profile",
            "scraped_chunks",
            "search_results",
            "site_knowledge",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_pool_bounds_connections() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        run_all_migrations(&db_path).unwrap();

        let pool = SqlitePool::new(&db_path, 1);
        let first = pool.get().await.unwrap();
        assert_eq!(pool.permits.available_permits(), 0);
        drop(first);
        assert_eq!(pool.permits.available_permits(), 1);
    }
}
