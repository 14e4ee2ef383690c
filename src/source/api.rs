//! Source backed by the intraday heart-rate HTTP API.
//!
//! One GET per day:
//! `{base_url}/{YYYY-MM-DD}/1d/{precision}/time/00:00/23:59.json`.
//! The response only carries wall-clock times, so every reading is stamped on
//! the requested local day.

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{OAuth2Session, Source, SourceError};
use crate::model::MeasurementPoint;

pub const DEFAULT_BASE_URL: &str = "https://api.fitbit.com/1/user/-/activities/heart/date";
pub const DEFAULT_PRECISION: &str = "1sec";

/// The intraday API does not report a confidence, every reading gets this.
const API_CONFIDENCE: i32 = 1;

#[derive(Debug, Deserialize)]
struct IntradayResponse {
    #[serde(rename = "activities-heart-intraday")]
    intraday: IntradayDataset,
}

#[derive(Debug, Deserialize)]
struct IntradayDataset {
    #[serde(default)]
    dataset: Vec<IntradayValue>,
}

#[derive(Debug, Deserialize)]
struct IntradayValue {
    time: String,
    value: i64,
}

/// How requests are authorized.
enum Auth {
    /// A fixed token passed on the command line.
    Static(String),
    Session(OAuth2Session),
}

pub struct ApiSource {
    client: Client,
    base_url: String,
    precision: String,
    auth: Auth,
    owner: String,
}

impl std::fmt::Debug for ApiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSource")
            .field("base_url", &self.base_url)
            .field("precision", &self.precision)
            .field("access_token", &"<redacted>")
            .field("refreshable", &matches!(self.auth, Auth::Session(_)))
            .field("owner", &self.owner)
            .finish()
    }
}

impl ApiSource {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        precision: impl Into<String>,
        access_token: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            precision: precision.into(),
            auth: Auth::Static(access_token.into()),
            owner: owner.into(),
        }
    }

    /// Source that takes its token from an OAuth2 session, refreshing it on
    /// expiry or when the API answers 401.
    pub fn with_session(
        client: Client,
        base_url: impl Into<String>,
        precision: impl Into<String>,
        session: OAuth2Session,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            auth: Auth::Session(session),
            ..Self::new(client, base_url, precision, String::new(), owner)
        }
    }

    async fn bearer(&self) -> Result<String, SourceError> {
        match &self.auth {
            Auth::Static(token) => Ok(token.clone()),
            Auth::Session(session) => session.access_token().await,
        }
    }

    async fn get(&self, url: &str, token: &str) -> Result<reqwest::Response, SourceError> {
        Ok(self.client.get(url).bearer_auth(token).send().await?)
    }

    fn day_url(&self, day: DateTime<Local>) -> String {
        format!(
            "{}/{}/1d/{}/time/00:00/23:59.json",
            self.base_url,
            day.format("%Y-%m-%d"),
            self.precision
        )
    }
}

#[async_trait]
impl Source for ApiSource {
    async fn read(&self, day: DateTime<Local>) -> Result<Vec<MeasurementPoint>, SourceError> {
        let url = self.day_url(day);
        tracing::debug!(url = %url, "Fetching intraday data");

        let token = self.bearer().await?;
        let mut response = self.get(&url, &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            if let Auth::Session(session) = &self.auth {
                tracing::info!("Access token rejected, refreshing");
                let token = session.refresh(&token).await?;
                response = self.get(&url, &token).await?;
            }
        }
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.bytes().await?;
        let points = parse_intraday(&body, day, &self.owner)?;
        tracing::debug!(count = points.len(), day = %day.format("%Y-%m-%d"), "Parsed intraday data");
        Ok(points)
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

fn parse_intraday(
    body: &[u8],
    day: DateTime<Local>,
    owner: &str,
) -> Result<Vec<MeasurementPoint>, SourceError> {
    let response: IntradayResponse =
        serde_json::from_slice(body).map_err(|source| SourceError::Payload {
            day: day.format("%Y-%m-%d").to_string(),
            source,
        })?;

    let date = day.date_naive();
    response
        .intraday
        .dataset
        .into_iter()
        .map(|v| {
            let time = NaiveTime::parse_from_str(&v.time, "%H:%M:%S")
                .map_err(|_| SourceError::Timestamp(v.time.clone()))?;
            let timestamp = Local
                .from_local_datetime(&date.and_time(time))
                .earliest()
                .ok_or_else(|| SourceError::Timestamp(v.time.clone()))?;
            Ok(MeasurementPoint::new(timestamp, v.value, API_CONFIDENCE, owner))
        })
        .collect()
}
