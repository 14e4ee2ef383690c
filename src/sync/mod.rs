//! Day-by-day export of measurements from a source into storage.
//!
//! [`SyncDriver`] performs a single pass over the elapsed days since a
//! starting point, skipping days the storage already holds.
//! [`ContinuousScheduler`] repeats passes every 24 hours.
//!
//! Neither keeps a cursor on disk: storage presence is the record of what has
//! been exported, so an interrupted pass is simply run again.

pub mod continuous;
pub mod driver;
pub mod error;

use async_trait::async_trait;
use chrono::{DateTime, Local};

pub use continuous::{ContinuousScheduler, PassErrorPolicy};
pub use driver::SyncDriver;
pub use error::SyncError;

/// How a pass ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every elapsed day was either exported or already present.
    Completed { exported: u32, skipped: u32 },
    /// Shutdown was requested before the pass finished.
    Cancelled,
}

/// A long-running export job that can be stopped from another task.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn run(&self) -> Result<PassOutcome, SyncError>;

    /// Cancel any in-flight `run`, release the source and storage, and wait
    /// for `run` to return.
    async fn close(&self) -> Result<(), SyncError>;
}

/// Source of "now", replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}
