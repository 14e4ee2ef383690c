//! OAuth2 credentials file and the refresh-token grant.
//!
//! The file is the JSON left behind by the authorization handshake:
//! `{"Token": {...}, "ClientID": "...", "ClientSecret": "...", "Scopes": [...]}`.
//! Unknown keys are kept so a rewrite never drops them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::SourceError;

pub const DEFAULT_TOKEN_URL: &str = "https://api.fitbit.com/oauth2/token";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_LEEWAY_SECS: i64 = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct Token {
    #[serde(default)]
    access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    token_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiry: Option<DateTime<Utc>>,
}

impl Token {
    /// A missing or zero expiry (`0001-01-01T00:00:00Z`) never expires.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .filter(|e| e.year() > 1)
            .is_some_and(|e| e - Duration::seconds(EXPIRY_LEEWAY_SECS) <= now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    #[serde(rename = "Token", default, skip_serializing_if = "Option::is_none")]
    token: Option<Token>,
    #[serde(rename = "ClientID", default)]
    client_id: String,
    #[serde(rename = "ClientSecret", default)]
    client_secret: String,
    #[serde(rename = "Scopes", default)]
    scopes: Vec<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Access token backed by a credentials file, refreshed on expiry and
/// written back after every refresh.
pub struct OAuth2Session {
    client: Client,
    path: PathBuf,
    token_url: String,
    creds: Mutex<CredentialsFile>,
}

impl std::fmt::Debug for OAuth2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth2Session")
            .field("path", &self.path)
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}

impl OAuth2Session {
    /// Read the credentials file. `client_id` and `client_secret` override
    /// the ones stored in the file when both are given.
    pub async fn load(
        client: Client,
        path: &Path,
        token_url: impl Into<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Self, SourceError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| SourceError::File {
                path: path.to_path_buf(),
                source,
            })?;
        let mut creds: CredentialsFile =
            serde_json::from_slice(&bytes).map_err(|source| SourceError::Payload {
                day: path.display().to_string(),
                source,
            })?;
        if creds
            .token
            .as_ref()
            .map_or(true, |t| t.access_token.is_empty())
        {
            return Err(SourceError::Credentials(format!(
                "no access token in {}",
                path.display()
            )));
        }
        if let (Some(id), Some(secret)) = (client_id, client_secret) {
            creds.client_id = id;
            creds.client_secret = secret;
        }
        Ok(Self {
            client,
            path: path.to_path_buf(),
            token_url: token_url.into(),
            creds: Mutex::new(creds),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current access token, refreshed first if it has expired.
    pub async fn access_token(&self) -> Result<String, SourceError> {
        let mut creds = self.creds.lock().await;
        let expired = creds
            .token
            .as_ref()
            .is_some_and(|t| t.is_expired(Utc::now()));
        if expired {
            tracing::info!("Access token expired, refreshing");
            return self.refresh_locked(&mut creds).await;
        }
        Ok(creds
            .token
            .as_ref()
            .map(|t| t.access_token.clone())
            .unwrap_or_default())
    }

    /// Refresh after the server rejected `rejected`. If another request has
    /// already replaced it, the newer token is returned without a refresh.
    pub async fn refresh(&self, rejected: &str) -> Result<String, SourceError> {
        let mut creds = self.creds.lock().await;
        if let Some(token) = creds.token.as_ref() {
            if token.access_token != rejected {
                return Ok(token.access_token.clone());
            }
        }
        self.refresh_locked(&mut creds).await
    }

    async fn refresh_locked(&self, creds: &mut CredentialsFile) -> Result<String, SourceError> {
        let refresh_token = creds
            .token
            .as_ref()
            .map(|t| t.refresh_token.clone())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                SourceError::Credentials(format!("no refresh token in {}", self.path.display()))
            })?;
        if creds.client_id.is_empty() || creds.client_secret.is_empty() {
            return Err(SourceError::Credentials(
                "client id and secret are required to refresh the access token".into(),
            ));
        }

        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::TokenRefresh {
                status: status.as_u16(),
                body,
            });
        }
        let body = response.bytes().await?;
        let fresh: TokenResponse =
            serde_json::from_slice(&body).map_err(|source| SourceError::Payload {
                day: self.token_url.clone(),
                source,
            })?;

        let previous = creds.token.take().unwrap_or_default();
        let token = Token {
            access_token: fresh.access_token,
            token_type: fresh.token_type.unwrap_or(previous.token_type),
            // The grant may omit the refresh token, in which case the old one stays valid.
            refresh_token: fresh
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or(previous.refresh_token),
            expiry: fresh
                .expires_in
                .and_then(Duration::try_seconds)
                .and_then(|d| Utc::now().checked_add_signed(d)),
        };
        let access_token = token.access_token.clone();
        creds.token = Some(token);
        self.persist(creds).await?;
        tracing::info!(path = %self.path.display(), "Access token refreshed");
        Ok(access_token)
    }

    /// Replace the credentials file through a temporary sibling.
    async fn persist(&self, creds: &CredentialsFile) -> Result<(), SourceError> {
        let json = serde_json::to_vec_pretty(creds).map_err(|source| SourceError::Payload {
            day: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        let write_err = |source| SourceError::Write {
            path: self.path.clone(),
            source,
        };
        tokio::fs::write(&tmp, json).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(write_err)?;
        Ok(())
    }
}
