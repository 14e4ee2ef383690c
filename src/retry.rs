use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Default pause between setup attempts.
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Default overall budget for setup attempts.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(120);

/// Fixed-period retry budget for idempotent setup calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineConfig {
    pub period: Duration,
    pub timeout: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_RETRY_PERIOD,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

/// Retry an async operation every `period` until it succeeds or `timeout` has
/// elapsed since the first attempt.
///
/// The first attempt happens immediately. Once the deadline has passed, the
/// error from the most recent attempt is returned. Only use this for
/// operations that are safe to repeat, such as creating a database that may
/// already exist.
pub async fn retry_until_deadline<F, Fut, T, E>(
    period: Duration,
    timeout: Duration,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if started.elapsed() > timeout {
                    return Err(e);
                }
                tracing::warn!(
                    attempt,
                    period_ms = period.as_millis() as u64,
                    error = %e,
                    "Failed to execute critical command, retrying..."
                );
                tokio::time::sleep(period).await;
            }
        }
    }
}
