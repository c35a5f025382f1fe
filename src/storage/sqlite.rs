// src/storage/sqlite.rs

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::storage::{Bucket, KvStore, StoreError};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv (
    bucket TEXT NOT NULL,
    key    TEXT NOT NULL,
    value  BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
);
";

/// SQLite-backed store with one `kv` table
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`
    ///
    /// The parent directory is created when missing and WAL mode is enabled.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::Open(format!("cannot open database {}: {e}", path.display())))?;

        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
            .map_err(|e| StoreError::Open(format!("cannot set WAL mode: {e}")))?;
        if mode != "wal" {
            return Err(StoreError::Open(format!(
                "failed to enable WAL mode: journal_mode is '{mode}'"
            )));
        }

        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::Open(format!("cannot create schema: {e}")))?;

        debug!(path = %path.display(), "opened sqlite store");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    /// Database file location
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn).map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl KvStore for SqliteStore {
    fn put(&self, bucket: Bucket, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (bucket, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
                params![bucket.as_str(), key, value],
            )
            .map(|_| ())
        })
    }

    fn get(&self, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn delete(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE bucket = ?1 AND key = ?2",
                params![bucket.as_str(), key],
            )
            .map(|n| n > 0)
        })
    }

    fn scan(&self, bucket: Bucket) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE bucket = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![bucket.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    fn exists(&self, bucket: Bucket, key: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM kv WHERE bucket = ?1 AND key = ?2)",
                params![bucket.as_str(), key],
                |row| row.get(0),
            )
        })
    }

    fn count(&self, bucket: Bucket) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM kv WHERE bucket = ?1",
                params![bucket.as_str()],
                |row| row.get(0),
            )
        })
    }
}
