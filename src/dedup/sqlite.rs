use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use super::{DedupStatus, DedupStore};
use crate::error::StoreError;

/// Dedup store in a SQLite file. Every instance pointing at the same file shares
/// one record set; the check-then-set is a single upsert statement, which SQLite
/// serializes across connections and processes.
///
/// Statements run on the blocking pool. A writer held up by another process
/// gives up after the configured busy timeout with `SQLITE_BUSY`.
#[derive(Clone)]
pub struct SqliteDedupStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDedupStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open dedup database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(busy_timeout)?;

        Self::run_migrations(&conn)?;

        info!("Dedup store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS dedup_records (
                key TEXT PRIMARY KEY,
                first_seen_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dedup_records_first_seen
                ON dedup_records(first_seen_ms);
            ",
        )
        .context("Failed to create dedup tables")?;
        Ok(())
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn check_and_mark(
        &self,
        key: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<DedupStatus, StoreError> {
        let key = key.to_string();
        let (now_ms, cutoff_ms) = (now.timestamp_millis(), cutoff.timestamp_millis());
        // Inserts a new key, or takes over an expired one. A live record makes the
        // WHERE clause false and nothing changes.
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO dedup_records (key, first_seen_ms) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET first_seen_ms = excluded.first_seen_ms
                     WHERE dedup_records.first_seen_ms <= ?3",
                    rusqlite::params![key, now_ms, cutoff_ms],
                )
            })
            .await?;

        Ok(if changed == 1 {
            DedupStatus::FirstSeen
        } else {
            DedupStatus::AlreadySeen
        })
    }

    async fn release(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| conn.execute("DELETE FROM dedup_records WHERE key = ?1", rusqlite::params![key]))
            .await?;
        Ok(())
    }

    async fn evict_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff_ms = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM dedup_records WHERE first_seen_ms <= ?1",
                rusqlite::params![cutoff_ms],
            )
        })
        .await
    }

    async fn tracked(&self, prefix: &str) -> Result<usize, StoreError> {
        let prefix = prefix.to_string();
        let count: i64 = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT count(*) FROM dedup_records WHERE substr(key, 1, length(?1)) = ?1",
                    rusqlite::params![prefix],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count as usize)
    }
}
