use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by storage backends and the batching layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to open or create the SQLite database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to create the directory that holds the database file.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A SQLite statement failed.
    #[error("Database query failed: {0}")]
    Sql(#[from] rusqlite::Error),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// InfluxDB answered with a non-success HTTP status.
    #[error("InfluxDB returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// InfluxDB accepted the request but reported a statement error.
    #[error("InfluxDB query error: {0}")]
    Query(String),

    /// The batching queue no longer accepts points.
    #[error("Storage is closed")]
    Closed,

    /// The background writer task panicked or was aborted.
    #[error("Background writer failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Internal lock was poisoned by a panicking thread.
    #[error("Lock poisoned: {0}")]
    Poisoned(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
