//! Source backed by an unpacked personal data export.
//!
//! The export contains one file per day, `heart_rate-YYYY-MM-DD.json`, holding
//! an array of `{ "dateTime": ..., "value": { "bpm": .., "confidence": .. } }`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Deserialize;

use super::{Source, SourceError};
use crate::model::MeasurementPoint;

/// Format used by the export for `dateTime`, e.g. `01/02/19 04:00:05`.
const EXPORT_DATETIME_FORMAT: &str = "%m/%d/%y %H:%M:%S";

#[derive(Debug, Deserialize)]
struct ExportRecord {
    #[serde(rename = "dateTime")]
    date_time: String,
    value: ExportValue,
}

#[derive(Debug, Deserialize)]
struct ExportValue {
    bpm: i64,
    #[serde(default)]
    confidence: i32,
}

#[derive(Debug)]
pub struct OfflineSource {
    dir: PathBuf,
    owner: String,
}

impl OfflineSource {
    pub fn new(dir: PathBuf, owner: impl Into<String>) -> Self {
        Self {
            dir,
            owner: owner.into(),
        }
    }

    /// Default export location when no directory is configured.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".local").join("fitbit-data-exporter"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, day: DateTime<Local>) -> PathBuf {
        self.dir
            .join(format!("heart_rate-{}.json", day.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl Source for OfflineSource {
    async fn read(&self, day: DateTime<Local>) -> Result<Vec<MeasurementPoint>, SourceError> {
        let path = self.file_for(day);
        tracing::debug!(path = %path.display(), "Reading export file");
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SourceError::File {
                path: path.clone(),
                source,
            })?;
        parse_export(&bytes, &day.format("%Y-%m-%d").to_string(), &self.owner)
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

fn parse_export(bytes: &[u8], day: &str, owner: &str) -> Result<Vec<MeasurementPoint>, SourceError> {
    let records: Vec<ExportRecord> =
        serde_json::from_slice(bytes).map_err(|source| SourceError::Payload {
            day: day.to_string(),
            source,
        })?;

    records
        .into_iter()
        .map(|r| {
            let timestamp = parse_export_datetime(&r.date_time)?;
            Ok(MeasurementPoint::new(
                timestamp,
                r.value.bpm,
                r.value.confidence,
                owner,
            ))
        })
        .collect()
}

/// Accept RFC 3339 timestamps as well as the export's own local format.
fn parse_export_datetime(s: &str) -> Result<DateTime<Local>, SourceError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(s, EXPORT_DATETIME_FORMAT)
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .ok_or_else(|| SourceError::Timestamp(s.to_string()))
}
