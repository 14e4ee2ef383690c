//! InfluxDB 1.x storage over the HTTP API.
//!
//! Writes go through a [`BatchWriter`]; presence checks query the server
//! directly. The database is created on connect, retrying while the server
//! is still starting up.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use reqwest::Client;
use serde::Deserialize;

use super::batch::{BatchConfig, BatchSink, BatchWriter};
use super::error::StorageError;
use super::line_protocol;
use super::Storage;
use crate::model::{MeasurementPoint, DAY, TABLE_NAME};
use crate::retry::{retry_until_deadline, DeadlineConfig};

pub const DEFAULT_DATABASE: &str = "fitbit-data";

/// Connection settings for an InfluxDB 1.x server.
#[derive(Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl std::fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("url", &self.url)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<serde_json::Value>,
    error: Option<String>,
}

impl QueryResponse {
    /// Surface top-level and per-statement errors.
    fn into_result(self) -> Result<Vec<StatementResult>, StorageError> {
        if let Some(e) = self.error {
            return Err(StorageError::Query(e));
        }
        if let Some(e) = self.results.iter().find_map(|r| r.error.clone()) {
            return Err(StorageError::Query(e));
        }
        Ok(self.results)
    }
}

/// Thin HTTP client for the `/query` and `/write` endpoints.
#[derive(Debug)]
struct InfluxClient {
    http: Client,
    config: InfluxConfig,
}

impl InfluxClient {
    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn credentials(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(u) = &self.config.username {
            params.push(("u", u.clone()));
        }
        if let Some(p) = &self.config.password {
            params.push(("p", p.clone()));
        }
        params
    }

    async fn query(&self, command: &str, write: bool) -> Result<Vec<StatementResult>, StorageError> {
        let url = self.endpoint("query");
        let mut params = self.credentials();
        params.push(("db", self.config.database.clone()));
        params.push(("q", command.to_string()));

        // Data-modifying statements must be POSTed, reads may use GET.
        let request = if write {
            self.http.post(&url).form(&params)
        } else {
            self.http.get(&url).query(&params)
        };
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: QueryResponse = serde_json::from_str(&body)?;
        parsed.into_result()
    }

    async fn ensure_database(&self) -> Result<(), StorageError> {
        self.query(&create_database_statement(&self.config.database), true)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl BatchSink<MeasurementPoint> for InfluxClient {
    async fn write_batch(&self, items: &[MeasurementPoint]) -> Result<(), StorageError> {
        let mut params = self.credentials();
        params.push(("db", self.config.database.clone()));
        params.push(("precision", "ms".to_string()));

        let response = self
            .http
            .post(self.endpoint("write"))
            .query(&params)
            .body(line_protocol::encode_batch(items))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Time-series storage writing batched line protocol.
#[derive(Debug)]
pub struct InfluxStorage {
    client: Arc<InfluxClient>,
    writer: BatchWriter<MeasurementPoint>,
}

impl InfluxStorage {
    /// Connect, create the database if needed, and start the batch writer.
    ///
    /// Database creation is retried according to `setup` before giving up.
    pub async fn connect(
        config: InfluxConfig,
        batch: BatchConfig,
        setup: DeadlineConfig,
    ) -> Result<Self, StorageError> {
        let client = Arc::new(InfluxClient {
            http: Client::new(),
            config,
        });

        retry_until_deadline(setup.period, setup.timeout, || client.ensure_database()).await?;
        tracing::debug!(
            url = %client.config.url,
            database = %client.config.database,
            "InfluxDB database ready"
        );

        let writer = BatchWriter::spawn(client.clone(), batch);
        Ok(Self { client, writer })
    }
}

#[async_trait]
impl Storage for InfluxStorage {
    async fn save(&self, points: Vec<MeasurementPoint>) -> Result<(), StorageError> {
        self.writer.submit(points).await
    }

    async fn is_present(&self, day: DateTime<Local>) -> Result<bool, StorageError> {
        let results = self.client.query(&presence_query(day), false).await?;
        Ok(results.first().is_some_and(|r| !r.series.is_empty()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.writer.close().await
    }
}

fn create_database_statement(database: &str) -> String {
    format!("CREATE DATABASE \"{}\"", database.replace('"', "\\\""))
}

/// Select at most one reading in `[day, day + 24h)`, bounds in epoch nanoseconds.
fn presence_query(day: DateTime<Local>) -> String {
    let start = day.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let end = (day + DAY).timestamp_nanos_opt().unwrap_or(i64::MAX);
    format!("SELECT value FROM {TABLE_NAME} WHERE time >= {start} AND time < {end} LIMIT 1")
}
