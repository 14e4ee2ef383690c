//! Relational storage on SQLite, one INSERT per reading.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat};
use rusqlite::Connection;

use super::error::StorageError;
use super::schema;
use super::Storage;
use crate::model::{MeasurementPoint, DAY};

pub struct SqliteStorage {
    /// rusqlite::Connection is not Sync. Every statement runs on the blocking
    /// pool so the async runtime is never stalled by disk I/O.
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, StorageError> {
    conn.lock()
        .map_err(|e| StorageError::Poisoned(e.to_string()))
}

impl SqliteStorage {
    /// Open or create the database at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StorageError::CreateDir {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
                }
            }
            let conn = Connection::open(&path_clone).map_err(|e| StorageError::Open {
                path: path_clone.clone(),
                source: e,
            })?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            schema::migrate(&conn)?;
            Ok::<_, StorageError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StorageError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    #[cfg(test)]
    fn count(&self) -> i64 {
        lock(&self.conn)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM heart_reading", [], |row| row.get(0))
            .unwrap()
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    /// Insert all points in one transaction, so a day is either stored
    /// completely or not at all.
    async fn save(&self, points: Vec<MeasurementPoint>) -> Result<(), StorageError> {
        let count = points.len();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO heart_reading (owner, time, time_ms, value, confidence) VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for p in &points {
                    stmt.execute(rusqlite::params![
                        &p.owner,
                        p.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false),
                        p.timestamp.timestamp_millis(),
                        p.value,
                        p.confidence,
                    ])
                    .inspect_err(|e| {
                        tracing::warn!(owner = %p.owner, time = %p.timestamp, value = p.value, error = %e, "Failed to insert reading");
                    })?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        tracing::debug!(count, "Inserted readings");
        Ok(())
    }

    async fn is_present(&self, day: DateTime<Local>) -> Result<bool, StorageError> {
        let start = day.timestamp_millis();
        let end = (day + DAY).timestamp_millis();
        self.with_conn(move |conn| {
            let present: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM heart_reading WHERE time_ms >= ?1 AND time_ms < ?2)",
                [start, end],
                |row| row.get(0),
            )?;
            Ok(present)
        })
        .await
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
