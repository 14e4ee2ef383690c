//! Repeats sync passes on a fixed period for daemon mode.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::driver::SyncDriver;
use super::error::SyncError;
use super::{Clock, Exporter, PassOutcome};
use crate::model::start_of_day;

/// Time between the start of one waiting period and the next pass.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// What the scheduler does when a pass fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PassErrorPolicy {
    /// Return the error from `run`, ending the scheduler.
    #[default]
    Stop,
    /// Log the error and try again on the next tick.
    NextTick,
}

/// Runs a pass immediately, then again every `period`, each later pass
/// starting at midnight of the day the tick fired.
///
/// Shutdown is scoped: the scheduler owns the parent token and its driver
/// holds a child, so cancelling the scheduler also cancels an in-flight pass.
pub struct ContinuousScheduler {
    driver: SyncDriver,
    cursor: RwLock<DateTime<Local>>,
    period: Duration,
    policy: PassErrorPolicy,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
    running: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ContinuousScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousScheduler")
            .field("cursor", &self.cursor())
            .field("period", &self.period)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ContinuousScheduler {
    /// Take ownership of `driver`, rebinding its cancellation to a child of
    /// the scheduler's token. The first pass starts at the driver's `since`.
    pub fn new(driver: SyncDriver) -> Self {
        let token = CancellationToken::new();
        let driver = driver.with_token(token.child_token());
        Self {
            cursor: RwLock::new(driver.since()),
            clock: driver.clock(),
            driver,
            period: DEFAULT_PERIOD,
            policy: PassErrorPolicy::default(),
            token,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_policy(mut self, policy: PassErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Start of the current (or next) pass.
    pub fn cursor(&self) -> DateTime<Local> {
        *self.cursor.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_cursor(&self, since: DateTime<Local>) {
        *self.cursor.write().unwrap_or_else(PoisonError::into_inner) = since;
    }
}

#[async_trait]
impl Exporter for ContinuousScheduler {
    /// Loop until shutdown or, under [`PassErrorPolicy::Stop`], the first
    /// failed pass. Never returns `Completed`.
    async fn run(&self) -> Result<PassOutcome, SyncError> {
        let _running = self.running.lock().await;

        // Ticks are only consumed between passes; a pass longer than the
        // period delays the next one instead of overlapping it.
        let period = self.period.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let since = self.cursor();
            tracing::info!(since = %since.format("%Y-%m-%d"), "Starting pass");

            match self.driver.pass(since).await {
                Ok(PassOutcome::Cancelled) => return Ok(PassOutcome::Cancelled),
                Ok(PassOutcome::Completed { .. }) => {}
                Err(e) => match self.policy {
                    PassErrorPolicy::Stop => return Err(e),
                    PassErrorPolicy::NextTick => {
                        tracing::warn!(error = %e, "Pass failed, retrying on next tick");
                    }
                },
            }

            tokio::select! {
                _ = self.token.cancelled() => {
                    tracing::info!("Scheduler stopped");
                    return Ok(PassOutcome::Cancelled);
                }
                _ = ticker.tick() => {
                    self.set_cursor(start_of_day(self.clock.now()));
                }
            }
        }
    }

    /// Cancel the scheduler scope, close the driver, and wait for `run` to
    /// exit. Returns the driver's close result.
    async fn close(&self) -> Result<(), SyncError> {
        self.token.cancel();
        let closed = self.driver.close().await;
        let _running = self.running.lock().await;
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MeasurementPoint;
    use crate::storage::{Storage, StorageError};
    use crate::sync::testing::{local, FakeClock, FakeSource, FakeStorage};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Advances two days on every read, so each pass after a tick still has
    /// elapsed days to check.
    struct SteppingClock(Mutex<DateTime<Local>>);

    impl Clock for SteppingClock {
        fn now(&self) -> DateTime<Local> {
            let mut now = self.0.lock().unwrap();
            let current = *now;
            *now = current + chrono::Duration::days(2);
            current
        }
    }

    /// Reports every day present after `delay`, tracking overlapping calls.
    struct SlowStorage {
        delay: Duration,
        origin: Instant,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        checks: Mutex<Vec<(Duration, NaiveDate)>>,
    }

    #[async_trait]
    impl Storage for SlowStorage {
        async fn save(&self, _points: Vec<MeasurementPoint>) -> Result<(), StorageError> {
            Ok(())
        }

        async fn is_present(&self, day: DateTime<Local>) -> Result<bool, StorageError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.checks
                .lock()
                .unwrap()
                .push((self.origin.elapsed(), day.date_naive()));
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn close(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    fn scheduler(
        since: DateTime<Local>,
        clock: Arc<FakeClock>,
        source: Arc<FakeSource>,
        storage: Arc<FakeStorage>,
    ) -> ContinuousScheduler {
        ContinuousScheduler::new(SyncDriver::new(since, source, storage).with_clock(clock))
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_resets_cursor_to_start_of_today() {
        let clock = Arc::new(FakeClock::new(local(2020, 1, 3, 9)));
        let source = Arc::new(FakeSource::default());
        let storage = Arc::new(FakeStorage::default());
        let s = Arc::new(scheduler(
            local(2020, 1, 1, 0),
            clock.clone(),
            source.clone(),
            storage.clone(),
        ));

        let runner = tokio::spawn({
            let s = s.clone();
            async move { s.run().await }
        });

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(storage.presence_calls().len(), 2);
        assert_eq!(s.cursor(), local(2020, 1, 1, 0));

        clock.set(local(2020, 2, 1, 9));
        tokio::time::sleep(DEFAULT_PERIOD + Duration::from_secs(1)).await;

        assert_eq!(s.cursor(), local(2020, 2, 1, 0));
        // 2020-02-01 has not elapsed yet, so the second pass exported nothing.
        assert_eq!(storage.presence_calls().len(), 2);
        assert!(!runner.is_finished());

        s.close().await.unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), PassOutcome::Cancelled);
        assert_eq!(source.closed.load(Ordering::SeqCst), 1);
        assert_eq!(storage.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_tick_restarts_at_midnight() {
        let clock = Arc::new(FakeClock::new(local(2020, 1, 3, 9)));
        let source = Arc::new(FakeSource::default());
        let storage = Arc::new(FakeStorage::default());
        let s = Arc::new(
            scheduler(local(2020, 1, 1, 0), clock.clone(), source.clone(), storage.clone())
                .with_period(Duration::from_secs(60)),
        );

        let runner = tokio::spawn({
            let s = s.clone();
            async move { s.run().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;

        // Each pass starts at midnight of the tick's day and ends 24h before
        // the tick, so nothing after the first pass is read.
        clock.set(local(2020, 1, 5, 9));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(s.cursor(), local(2020, 1, 5, 0));

        clock.set(local(2020, 1, 7, 9));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(s.cursor(), local(2020, 1, 7, 0));
        assert_eq!(
            source.reads(),
            vec![
                NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
            ]
        );

        s.close().await.unwrap();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_error_stops_scheduler_by_default() {
        let clock = Arc::new(FakeClock::new(local(2020, 1, 3, 9)));
        let source = Arc::new(FakeSource::default());
        let storage = Arc::new(FakeStorage {
            fail_presence_on: NaiveDate::from_ymd_opt(2020, 1, 2),
            ..Default::default()
        });
        let s = scheduler(local(2020, 1, 1, 0), clock, source.clone(), storage);

        let err = s.run().await.unwrap_err();
        assert!(matches!(err, SyncError::Presence { .. }));
        assert_eq!(source.reads().len(), 1);
        s.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_policy_survives_pass_error() {
        let clock = Arc::new(FakeClock::new(local(2020, 1, 3, 9)));
        let source = Arc::new(FakeSource {
            fail_on: NaiveDate::from_ymd_opt(2020, 1, 1),
            ..Default::default()
        });
        let storage = Arc::new(FakeStorage::default());
        let s = Arc::new(
            scheduler(local(2020, 1, 1, 0), clock.clone(), source.clone(), storage)
                .with_policy(PassErrorPolicy::NextTick),
        );

        let runner = tokio::spawn({
            let s = s.clone();
            async move { s.run().await }
        });
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!runner.is_finished());

        clock.set(local(2020, 1, 4, 9));
        tokio::time::sleep(DEFAULT_PERIOD).await;
        assert_eq!(s.cursor(), local(2020, 1, 4, 0));
        assert!(!runner.is_finished());

        s.close().await.unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), PassOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_close_cancels_driver_scope() {
        let clock = Arc::new(FakeClock::new(local(2020, 1, 3, 9)));
        let source = Arc::new(FakeSource::default());
        let storage = Arc::new(FakeStorage::default());
        let s = scheduler(local(2020, 1, 1, 0), clock, source.clone(), storage.clone());

        s.close().await.unwrap();
        assert_eq!(s.driver.run().await.unwrap(), PassOutcome::Cancelled);
        assert!(storage.presence_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_longer_than_period_delays_next_pass() {
        let storage = Arc::new(SlowStorage {
            delay: Duration::from_secs(50),
            origin: Instant::now(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            checks: Mutex::new(Vec::new()),
        });
        let clock = Arc::new(SteppingClock(Mutex::new(local(2020, 1, 3, 9))));
        let driver = SyncDriver::new(
            local(2020, 1, 1, 0),
            Arc::new(FakeSource::default()),
            storage.clone(),
        )
        .with_clock(clock);
        // Two days per pass at 50s each: every pass takes 100s against a 60s period.
        let s = Arc::new(ContinuousScheduler::new(driver).with_period(Duration::from_secs(60)));

        let runner = tokio::spawn({
            let s = s.clone();
            async move { s.run().await }
        });
        tokio::time::sleep(Duration::from_secs(230)).await;
        s.close().await.unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), PassOutcome::Cancelled);

        assert_eq!(storage.max_in_flight.load(Ordering::SeqCst), 1);
        let secs = |n| Duration::from_secs(n);
        let date = |m, d| NaiveDate::from_ymd_opt(2020, m, d).unwrap();
        assert_eq!(
            *storage.checks.lock().unwrap(),
            vec![
                (secs(0), date(1, 1)),
                (secs(50), date(1, 2)),
                // The missed tick fires as soon as the first pass ends.
                (secs(100), date(1, 5)),
                (secs(150), date(1, 6)),
                (secs(200), date(1, 9)),
            ]
        );
    }
}
