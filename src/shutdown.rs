//! Signal handling: graceful shutdown and the runtime log-level toggle.
//!
//! SIGINT (Ctrl+C), SIGTERM and SIGHUP cancel a
//! [`tokio_util::sync::CancellationToken`] so the exporter can flush buffered
//! readings before exiting. A second signal force-exits. SIGUSR2 switches
//! logging between the configured filter and `debug`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub(crate) type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Install signal handlers and return a [`CancellationToken`] that is
/// cancelled on the first SIGINT / SIGTERM / SIGHUP.  A second signal
/// force-exits the process.
pub(crate) fn install_signal_handler() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let (mut sigterm, mut sighup) = {
        use tokio::signal::unix::{signal, SignalKind};
        (
            signal(SignalKind::terminate())?,
            signal(SignalKind::hangup())?,
        )
    };

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                    return;
                }
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::warn!("Received shutdown signal, flushing buffered readings...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}

/// Run `fut` unless `token` is cancelled first. Returns `None` on cancel.
pub(crate) async fn unless_cancelled<F: std::future::Future>(
    token: &CancellationToken,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = token.cancelled() => None,
    }
}

/// Flips the active log filter between the configured directives and `debug`.
pub(crate) struct LogToggle {
    handle: FilterHandle,
    base: String,
    debug: AtomicBool,
}

impl LogToggle {
    pub(crate) fn new(handle: FilterHandle, base: impl Into<String>) -> Self {
        Self {
            handle,
            base: base.into(),
            debug: AtomicBool::new(false),
        }
    }

    /// Switch to the other filter. Returns `true` if debug is now active.
    pub(crate) fn toggle(&self) -> Result<bool, reload::Error> {
        let debug = !self.debug.load(Ordering::SeqCst);
        let directives = if debug { "debug" } else { self.base.as_str() };
        self.handle.reload(EnvFilter::new(directives))?;
        self.debug.store(debug, Ordering::SeqCst);
        Ok(debug)
    }
}

/// Toggle the log level on every SIGUSR2. No-op on platforms without it.
pub(crate) fn install_log_toggle(toggle: LogToggle) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        tokio::spawn(async move {
            while sigusr2.recv().await.is_some() {
                match toggle.toggle() {
                    Ok(true) => tracing::warn!("Debug logging enabled"),
                    Ok(false) => tracing::warn!(filter = %toggle.base, "Debug logging disabled"),
                    Err(e) => tracing::error!(error = %e, "Failed to change log level"),
                }
            }
        });
    }
    #[cfg(not(unix))]
    drop(toggle);
    Ok(())
}
