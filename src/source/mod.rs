//! Measurement sources.
//!
//! A source answers one question: which readings were taken during a given
//! local day. Two implementations exist, one backed by the intraday HTTP API
//! and one reading files from an unpacked personal data export.

pub mod api;
pub mod error;
pub mod oauth2;
pub mod offline;

use async_trait::async_trait;
use chrono::{DateTime, Local};

use crate::model::MeasurementPoint;

pub use api::ApiSource;
pub use error::SourceError;
pub use oauth2::OAuth2Session;
pub use offline::OfflineSource;

/// Trait for reading a day of measurements.
///
/// Object-safe so the sync driver can hold an `Arc<dyn Source>` without
/// knowing which variant it talks to.
#[async_trait]
pub trait Source: Send + Sync {
    /// Return every reading whose timestamp falls within the local calendar
    /// day starting at `day`.
    async fn read(&self, day: DateTime<Local>) -> Result<Vec<MeasurementPoint>, SourceError>;

    /// Release any resources held by the source.
    async fn close(&self) -> Result<(), SourceError>;
}
