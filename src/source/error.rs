use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading a day of measurements from a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read {path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid payload for {day}: {source}")]
    Payload {
        day: String,
        source: serde_json::Error,
    },

    #[error("Invalid timestamp '{0}'")]
    Timestamp(String),

    #[error("Missing credentials: {0}")]
    Credentials(String),

    #[error("Token refresh failed with HTTP {status}: {body}")]
    TokenRefresh { status: u16, body: String },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
