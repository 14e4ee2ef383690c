//! Single pass over the elapsed days since a starting point.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use super::error::SyncError;
use super::{Clock, Exporter, PassOutcome, SystemClock};
use crate::model::DAY;
use crate::source::Source;
use crate::storage::{Storage, StorageError};

/// Walks days from `since` up to, but excluding, the last 24 hours, exporting
/// every day the storage does not already hold.
///
/// Presence in storage is the only record of progress, so a failed or
/// interrupted pass can be re-run from the same `since` at no cost beyond one
/// presence query per already-exported day.
pub struct SyncDriver {
    since: DateTime<Local>,
    source: Arc<dyn Source>,
    storage: Arc<dyn Storage>,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a pass; `close` acquires it to wait for the
    /// in-flight pass to return.
    running: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDriver")
            .field("since", &self.since)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl SyncDriver {
    pub fn new(since: DateTime<Local>, source: Arc<dyn Source>, storage: Arc<dyn Storage>) -> Self {
        Self {
            since,
            source,
            storage,
            token: CancellationToken::new(),
            clock: Arc::new(SystemClock),
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the cancellation token, e.g. with a child of an outer scope.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn since(&self) -> DateTime<Local> {
        self.since
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Run one pass starting at `since`.
    ///
    /// The end of the range is fixed when the pass starts: days are processed
    /// while they begin more than 24 hours before that moment. Cancellation is
    /// checked before each day.
    pub async fn pass(&self, since: DateTime<Local>) -> Result<PassOutcome, SyncError> {
        let _running = self.running.lock().await;
        let end = self.clock.now() - DAY;

        let mut exported = 0u32;
        let mut skipped = 0u32;
        let mut day = since;

        while day < end {
            if self.token.is_cancelled() {
                tracing::info!(day = %day.format("%Y-%m-%d"), "Pass cancelled");
                return Ok(PassOutcome::Cancelled);
            }

            tracing::info!(day = %day.format("%Y-%m-%d"), "Reading data for day");

            let present = self
                .storage
                .is_present(day)
                .await
                .map_err(|source| SyncError::Presence { day, source })?;
            if present {
                tracing::debug!(day = %day.format("%Y-%m-%d"), "Day already present, skipping");
                skipped += 1;
                day += DAY;
                continue;
            }

            let points = self
                .source
                .read(day)
                .await
                .map_err(|source| SyncError::Read { day, source })?;
            tracing::debug!(
                day = %day.format("%Y-%m-%d"),
                count = points.len(),
                "Data successfully read"
            );

            match self.storage.save(points).await {
                Ok(()) => exported += 1,
                // Shutdown closed the queue under a blocked submit.
                Err(StorageError::Closed) if self.token.is_cancelled() => {
                    tracing::info!(day = %day.format("%Y-%m-%d"), "Pass cancelled while saving");
                    return Ok(PassOutcome::Cancelled);
                }
                Err(source) => return Err(SyncError::Save { day, source }),
            }

            day += DAY;
        }

        tracing::info!(exported, skipped, "Pass complete");
        Ok(PassOutcome::Completed { exported, skipped })
    }
}

#[async_trait]
impl Exporter for SyncDriver {
    async fn run(&self) -> Result<PassOutcome, SyncError> {
        self.pass(self.since).await
    }

    /// Cancel, release the source and storage, then wait for any in-flight
    /// pass. Storage is closed before waiting so that a pass blocked on a
    /// full write queue is released.
    async fn close(&self) -> Result<(), SyncError> {
        self.token.cancel();

        if let Err(e) = self.source.close().await {
            tracing::warn!(error = %e, "Failed to close source");
        }
        let closed = self.storage.close().await;

        let _running = self.running.lock().await;
        closed.map_err(SyncError::Close)
    }
}
