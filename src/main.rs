//! fde-rs: incrementally export daily heart-rate readings.
//!
//! Walks calendar days from a starting date, skips days the storage already
//! holds, and copies the rest from either the online intraday API or an
//! offline data export into InfluxDB or SQLite. In daemon mode the export
//! repeats every 24 hours.

#![warn(clippy::all)]

mod cli;
mod config;
mod model;
pub mod retry;
mod shutdown;
mod source;
mod storage;
mod sync;
mod types;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use config::{Config, SourceConfig, StorageConfig};
use source::{ApiSource, OAuth2Session, OfflineSource, Source};
use storage::{InfluxStorage, SqliteStorage, Storage};
use sync::{ContinuousScheduler, Exporter, PassErrorPolicy, PassOutcome, SyncDriver};

/// Open the configured storage. InfluxDB setup is retried until the
/// configured deadline.
async fn open_storage(config: &Config) -> anyhow::Result<Arc<dyn Storage>> {
    match &config.storage {
        StorageConfig::Sqlite(path) => {
            let db = SqliteStorage::open(path).await?;
            tracing::info!(path = %db.path().display(), "Using SQLite storage");
            Ok(Arc::new(db))
        }
        StorageConfig::Influx(influx) => {
            tracing::info!(
                url = %influx.url,
                database = %influx.database,
                "Connecting to InfluxDB"
            );
            let db = InfluxStorage::connect(influx.clone(), config.batch, config.setup)
                .await
                .with_context(|| format!("Failed to set up InfluxDB at {}", influx.url))?;
            Ok(Arc::new(db))
        }
    }
}

/// Build the configured source. Returns the pass error policy when the
/// export should keep running as a daemon.
async fn open_source(
    config: &Config,
) -> anyhow::Result<(Arc<dyn Source>, Option<PassErrorPolicy>)> {
    match &config.source {
        SourceConfig::Offline { dir } => {
            let source = OfflineSource::new(dir.clone(), &config.owner);
            tracing::info!(dir = %source.dir().display(), "Reading exported files");
            Ok((Arc::new(source), None))
        }
        SourceConfig::Api {
            conf_file,
            access_token,
            client_id,
            client_secret,
            token_url,
            base_url,
            precision,
            daemon,
            on_pass_error,
        } => {
            let client = reqwest::Client::builder()
                .user_agent(concat!("fde-rs/", env!("CARGO_PKG_VERSION")))
                .build()?;
            let source = match access_token {
                Some(token) => ApiSource::new(client, base_url, precision, token, &config.owner),
                None => {
                    let session = OAuth2Session::load(
                        client.clone(),
                        conf_file,
                        token_url,
                        client_id.clone(),
                        client_secret.clone(),
                    )
                    .await
                    .with_context(|| {
                        format!("Failed to load credentials from {}", conf_file.display())
                    })?;
                    tracing::info!(path = %session.path().display(), "Using OAuth2 credentials");
                    ApiSource::with_session(client, base_url, precision, session, &config.owner)
                }
            };
            tracing::info!(base_url = %base_url, precision = %precision, "Reading from API");
            Ok((Arc::new(source), daemon.then_some(*on_pass_error)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_cli(cli::Cli::parse())?;

    // RUST_LOG wins over --log-level; SIGUSR2 toggles between this and debug.
    let base_filter = config
        .log_level
        .resolve_filter(std::env::var("RUST_LOG").ok().as_deref());
    let (filter, filter_handle) = reload::Layer::new(EnvFilter::new(&base_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    shutdown::install_log_toggle(shutdown::LogToggle::new(filter_handle, base_filter))?;

    tracing::info!(
        owner = %config.owner,
        since = %config.since.format("%Y-%m-%d"),
        "Starting fde-rs"
    );
    tracing::debug!(?config, "Resolved configuration");

    // Installed before setup so a signal during the InfluxDB retry still exits cleanly.
    let shutdown_token = shutdown::install_signal_handler()?;

    let Some(storage) = shutdown::unless_cancelled(&shutdown_token, open_storage(&config)).await
    else {
        tracing::warn!("Shutdown requested during storage setup");
        return Ok(());
    };
    let storage = storage?;
    let (source, daemon) = match open_source(&config).await {
        Ok(opened) => opened,
        Err(e) => {
            if let Err(close_err) = storage.close().await {
                tracing::warn!(error = %close_err, "Failed to close storage");
            }
            return Err(e);
        }
    };

    let driver = SyncDriver::new(config.since, source, storage);
    let exporter: Arc<dyn Exporter> = match daemon {
        Some(policy) => {
            tracing::info!(?policy, "Running as daemon");
            Arc::new(ContinuousScheduler::new(driver).with_policy(policy))
        }
        None => Arc::new(driver),
    };

    let mut runner = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.run().await }
    });

    let finished = tokio::select! {
        result = &mut runner => Some(result),
        _ = shutdown_token.cancelled() => {
            tracing::warn!("Stopping gracefully...");
            None
        }
    };

    // Always close: flushes buffered readings and waits for the run to stop.
    let closed = exporter.close().await;
    let result = match finished {
        Some(result) => result,
        None => runner.await,
    }
    .context("Export task panicked")?;

    match result {
        Ok(PassOutcome::Completed { exported, skipped }) => {
            tracing::info!(exported, skipped, "Export complete");
        }
        Ok(PassOutcome::Cancelled) => tracing::info!("Export stopped"),
        Err(e) => {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "Failed to close storage");
            }
            return Err(e.into());
        }
    }

    closed?;
    Ok(())
}
