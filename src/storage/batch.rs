//! Asynchronous batching in front of a write-once-per-batch backend.
//!
//! Producers call [`BatchWriter::submit`], which only enqueues onto a bounded
//! channel. A single background task owns the pending batch and writes it to
//! the [`BatchSink`] when:
//! - the batch reaches `batch_size` points
//! - `flush_interval` elapses
//! - [`BatchWriter::close`] is called
//!
//! A failed write leaves the batch untouched, so the same points go out again
//! with the next flush. The backend must tolerate seeing them twice.
//!
//! The writer expects a single producer. Calling `submit` concurrently with
//! `close` is not supported; `close` does however fail a `submit` that is
//! blocked on a full queue instead of leaving it hanging.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::error::StorageError;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Backend that accepts a whole batch in one call.
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static {
    async fn write_batch(&self, items: &[T]) -> Result<(), StorageError>;
}

/// Batch flush thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Queue capacity and flush threshold, in points.
    pub batch_size: usize,
    /// Flush the pending batch at least this often.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Why a flush was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Interval,
    Threshold,
    Shutdown,
}

/// Points waiting for a successful write, in submission order.
struct Batch<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Batch<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        self.items.push(item);
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop the flushed points by starting a fresh batch.
    fn reset(&mut self) {
        self.items = Vec::with_capacity(self.capacity);
    }
}

type ErrorCell = Arc<RwLock<Option<StorageError>>>;

pub struct BatchWriter<T> {
    queue: Mutex<Option<mpsc::Sender<T>>>,
    close_signal: Mutex<Option<oneshot::Sender<()>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    last_error: ErrorCell,
}

impl<T> BatchWriter<T> {
    /// Message of the most recent failed flush, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ToString::to_string)
    }
}

impl<T> std::fmt::Debug for BatchWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("last_error", &self.last_error())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> BatchWriter<T> {
    /// Start the background worker. Must be called from within a tokio runtime.
    pub fn spawn<S>(sink: Arc<S>, config: BatchConfig) -> Self
    where
        S: BatchSink<T>,
    {
        let batch_size = config.batch_size.max(1);
        let (tx, rx) = mpsc::channel(batch_size);
        let (close_tx, close_rx) = oneshot::channel();
        let last_error: ErrorCell = Arc::new(RwLock::new(None));

        let worker = Worker {
            sink,
            batch: Batch::new(batch_size),
            batch_size,
            last_error: last_error.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, close_rx, config.flush_interval));

        Self {
            queue: Mutex::new(Some(tx)),
            close_signal: Mutex::new(Some(close_tx)),
            worker: tokio::sync::Mutex::new(Some(handle)),
            last_error,
        }
    }

    /// Enqueue points one at a time, in order.
    ///
    /// Waits while the queue is full. Never performs I/O, so backend failures
    /// are not reported here.
    pub async fn submit(&self, items: impl IntoIterator<Item = T>) -> Result<(), StorageError> {
        let tx = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::Closed)?;

        for item in items {
            tx.send(item).await.map_err(|_| StorageError::Closed)?;
        }
        Ok(())
    }

    /// Stop accepting points, flush everything still queued, and wait for the
    /// worker to finish.
    ///
    /// Returns the error of the terminal flush, if it failed. Calling `close`
    /// again afterwards returns `Ok(())`.
    pub async fn close(&self) -> Result<(), StorageError> {
        let close_tx = self
            .close_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(close_tx) = close_tx {
            let _ = close_tx.send(());
        }
        drop(
            self.queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let Some(handle) = self.worker.lock().await.take() else {
            return Ok(());
        };
        handle.await?;

        match self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Worker<T, S> {
    sink: Arc<S>,
    batch: Batch<T>,
    batch_size: usize,
    last_error: ErrorCell,
}

impl<T: Send + Sync + 'static, S: BatchSink<T>> Worker<T, S> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<T>,
        mut close_rx: oneshot::Receiver<()>,
        flush_interval: Duration,
    ) {
        let flush_interval = flush_interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush(FlushReason::Interval).await;
                }
                item = rx.recv() => match item {
                    Some(item) => self.push(item).await,
                    None => {
                        // Every sender is gone: the writer was closed or dropped.
                        self.flush(FlushReason::Shutdown).await;
                        break;
                    }
                },
                _ = &mut close_rx => {
                    rx.close();
                    while let Some(item) = rx.recv().await {
                        self.push(item).await;
                    }
                    self.flush(FlushReason::Shutdown).await;
                    break;
                }
            }
        }
        tracing::debug!("Batch writer stopped");
    }

    async fn push(&mut self, item: T) {
        self.batch.push(item);
        if self.batch.len() >= self.batch_size {
            self.flush(FlushReason::Threshold).await;
        }
    }

    async fn flush(&mut self, reason: FlushReason) {
        if self.batch.is_empty() {
            self.set_error(None);
            return;
        }

        let count = self.batch.len();
        match self.sink.write_batch(&self.batch.items).await {
            Ok(()) => {
                tracing::debug!(count, ?reason, "Flushed batch");
                self.batch.reset();
                self.set_error(None);
            }
            Err(e) => {
                tracing::warn!(
                    count,
                    ?reason,
                    error = %e,
                    "Failed to flush batch, keeping points for the next attempt"
                );
                self.set_error(Some(e));
            }
        }
    }

    fn set_error(&self, error: Option<StorageError>) {
        *self
            .last_error
            .write()
            .unwrap_or_else(PoisonError::into_inner) = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every attempted batch and fails the first `fail_first` writes.
    #[derive(Default)]
    struct RecordingSink {
        attempts: Mutex<Vec<Vec<u32>>>,
        fail_first: AtomicUsize,
        always_fail: bool,
    }

    impl RecordingSink {
        fn failing_first(n: usize) -> Self {
            Self {
                fail_first: AtomicUsize::new(n),
                ..Default::default()
            }
        }

        fn always_failing() -> Self {
            Self {
                always_fail: true,
                ..Default::default()
            }
        }

        fn attempts(&self) -> Vec<Vec<u32>> {
            self.attempts.lock().unwrap().clone()
        }

        fn attempt_sizes(&self) -> Vec<usize> {
            self.attempts().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl BatchSink<u32> for RecordingSink {
        async fn write_batch(&self, items: &[u32]) -> Result<(), StorageError> {
            self.attempts.lock().unwrap().push(items.to_vec());
            if self.always_fail {
                return Err(StorageError::Query("backend down".into()));
            }
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Query("backend down".into()));
            }
            Ok(())
        }
    }

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            flush_interval: Duration::from_secs(3600),
        }
    }

    /// Let the worker drain the queue without reaching the flush interval.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_threshold_does_not_flush() {
        let sink = Arc::new(RecordingSink::default());
        let writer = BatchWriter::spawn(sink.clone(), config(100));

        writer.submit(0..99).await.unwrap();
        settle().await;

        assert!(sink.attempts().is_empty());
        writer.close().await.unwrap();
        assert_eq!(sink.attempt_sizes(), vec![99]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_threshold_flushes_once() {
        let sink = Arc::new(RecordingSink::default());
        let writer = BatchWriter::spawn(sink.clone(), config(100));

        writer.submit(0..100).await.unwrap();
        settle().await;

        assert_eq!(sink.attempt_sizes(), vec![100]);
        writer.close().await.unwrap();
        // Terminal flush found an empty batch, nothing more was written.
        assert_eq!(sink.attempt_sizes(), vec![100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_and_a_half_batches() {
        let sink = Arc::new(RecordingSink::default());
        let writer = BatchWriter::spawn(sink.clone(), config(100));

        writer.submit(0..250).await.unwrap();
        writer.close().await.unwrap();

        let attempts = sink.attempts();
        assert_eq!(sink.attempt_sizes(), vec![100, 100, 50]);
        assert_eq!(attempts[0], (0..100).collect::<Vec<_>>());
        assert_eq!(attempts[1], (100..200).collect::<Vec<_>>());
        assert_eq!(attempts[2], (200..250).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let sink = Arc::new(RecordingSink::default());
        let writer = BatchWriter::spawn(
            sink.clone(),
            BatchConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(5),
            },
        );

        writer.submit([1, 2]).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(sink.attempts(), vec![vec![1, 2]]);
        writer.close().await.unwrap();
        assert_eq!(sink.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_keeps_points_in_order() {
        let sink = Arc::new(RecordingSink::failing_first(1));
        let writer = BatchWriter::spawn(sink.clone(), config(3));

        writer.submit([1, 2, 3]).await.unwrap();
        settle().await;
        assert_eq!(writer.last_error().as_deref(), Some("InfluxDB query error: backend down"));

        writer.submit([4]).await.unwrap();
        settle().await;

        assert_eq!(sink.attempts(), vec![vec![1, 2, 3], vec![1, 2, 3, 4]]);
        assert!(writer.last_error().is_none());

        writer.submit([5]).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(sink.attempts().last().unwrap(), &vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_terminal_flush_error() {
        let sink = Arc::new(RecordingSink::always_failing());
        let writer = BatchWriter::spawn(sink.clone(), config(10));

        writer.submit([7, 8]).await.unwrap();
        let err = writer.close().await.unwrap_err();

        assert!(matches!(err, StorageError::Query(_)));
        assert_eq!(sink.attempts(), vec![vec![7, 8]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_succeeds_after_earlier_failure_is_recovered() {
        let sink = Arc::new(RecordingSink::failing_first(1));
        let writer = BatchWriter::spawn(sink.clone(), config(2));

        writer.submit([1, 2]).await.unwrap();
        settle().await;
        assert!(writer.last_error().is_some());

        writer.close().await.unwrap();
        assert_eq!(sink.attempts(), vec![vec![1, 2], vec![1, 2]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_on_idle_writer_writes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let writer: BatchWriter<u32> = BatchWriter::spawn(sink.clone(), config(10));

        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert!(sink.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_after_close_is_rejected() {
        let sink = Arc::new(RecordingSink::default());
        let writer = BatchWriter::spawn(sink.clone(), config(10));
        writer.close().await.unwrap();

        assert!(matches!(
            writer.submit([1]).await,
            Err(StorageError::Closed)
        ));
    }
}
