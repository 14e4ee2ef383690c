//! Storage backends.
//!
//! Two sinks implement [`Storage`]:
//! - [`InfluxStorage`] writes through the asynchronous [`BatchWriter`]
//! - [`SqliteStorage`] inserts row by row
//!
//! Both expose the same logical record (`owner`, `time`, `value`,
//! `confidence`) and answer presence queries over a half-open 24-hour window.

pub mod batch;
pub mod error;
pub mod influx;
pub mod line_protocol;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::model::MeasurementPoint;

pub use batch::{BatchConfig, BatchSink, BatchWriter};
pub use error::StorageError;
pub use influx::{InfluxConfig, InfluxStorage};
pub use sqlite::SqliteStorage;

/// Trait for persisting measurements.
///
/// Object-safe, used as `Arc<dyn Storage>` by the sync driver.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Hand points over for persistence.
    ///
    /// Batched backends only enqueue here, so a backend failure may surface
    /// later, from [`Storage::close`].
    async fn save(&self, points: Vec<MeasurementPoint>) -> Result<(), StorageError>;

    /// Whether at least one record exists in `[day, day + 24h)`.
    ///
    /// Must not modify the backend.
    async fn is_present(&self, day: DateTime<Local>) -> Result<bool, StorageError>;

    /// Flush anything still buffered and release the backend.
    async fn close(&self) -> Result<(), StorageError>;
}
