use chrono::{DateTime, Local};
use thiserror::Error;

use crate::source::SourceError;
use crate::storage::StorageError;

/// Errors that abort a sync pass.
///
/// Each variant carries the day being processed so the operator knows where
/// the next run will resume.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to verify presence for {date}: {source}", date = .day.format("%Y-%m-%d"))]
    Presence {
        day: DateTime<Local>,
        source: StorageError,
    },

    #[error("failed to read data for {date}: {source}", date = .day.format("%Y-%m-%d"))]
    Read {
        day: DateTime<Local>,
        source: SourceError,
    },

    #[error("failed to save data for {date}: {source}", date = .day.format("%Y-%m-%d"))]
    Save {
        day: DateTime<Local>,
        source: StorageError,
    },

    #[error("failed to close storage: {0}")]
    Close(#[source] StorageError),
}

impl SyncError {
    /// The day the pass stopped at, if the error is tied to one.
    pub fn day(&self) -> Option<DateTime<Local>> {
        match self {
            SyncError::Presence { day, .. }
            | SyncError::Read { day, .. }
            | SyncError::Save { day, .. } => Some(*day),
            SyncError::Close(_) => None,
        }
    }
}
