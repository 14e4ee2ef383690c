//! SQLite schema for exported readings.

use rusqlite::Connection;

use super::error::StorageError;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS heart_reading (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    time TEXT NOT NULL,
    time_ms INTEGER NOT NULL,
    value INTEGER NOT NULL,
    confidence INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_heart_reading_time_ms ON heart_reading(time_ms);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Create or upgrade the schema. Safe to run on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StorageError> {
    let current = get_schema_version(conn)?;

    if current > SCHEMA_VERSION {
        return Err(StorageError::UnsupportedSchemaVersion {
            found: current,
            expected: SCHEMA_VERSION,
        });
    }

    if current < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!(from = current, to = SCHEMA_VERSION, "Migrations run");
    }

    Ok(())
}
