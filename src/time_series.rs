//! # Time-series collaborator
//!
//! Trait boundaries for the external time-series store: reading
//! recent per-property request counts (consumed by `LevelController`)
//! and writing aggregated counts (consumed by `AggregationWorker`).
//! Neither the relational/columnar storage nor the query language
//! live here, only the interface shape, expressed as `async_trait`
//! objects the way `PHiBBeRR-PulseArc` expresses its external
//! collaborators (e.g. `TimeEntryForwarder` in
//! `crates/infra/src/sync/outbox_worker.rs`).
use crate::bucket::TimestampMs;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// One row of `(property, timestamp, count)` returned by a recent
/// counts query. Ordered by `ts` ascending within each property; rows
/// for different properties may interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRow {
    pub property_id: i32,
    pub ts: TimestampMs,
    pub count: i64,
}

/// Read side of the time-series collaborator.
#[async_trait]
pub trait TimeSeriesReader: Send + Sync {
    /// Return up to `batch_size` of the most recent `(property, ts,
    /// count)` rows within `lookback` of now, aggregated into windows
    /// of `bucket_size`.
    async fn query_recent_counts(
        &self,
        bucket_size_ms: u64,
        lookback_ms: u64,
        batch_size: usize,
    ) -> Result<Vec<CountRow>>;
}

/// Write side of the time-series collaborator.
#[async_trait]
pub trait TimeSeriesWriter: Send + Sync {
    /// Write an aggregated batch of `property_id -> count`, as of
    /// `as_of`.
    async fn insert_counts(&self, batch: HashMap<i32, i64>, as_of: TimestampMs) -> Result<()>;
}

/// An in-memory fake of both collaborator traits, used by this
/// crate's own tests and usable as a starting point for integration
/// tests against a real store.
#[derive(Default)]
pub struct InMemoryTimeSeries {
    rows: std::sync::Mutex<Vec<CountRow>>,
    writes: std::sync::Mutex<Vec<(HashMap<i32, i64>, TimestampMs)>>,
    fail_reads: std::sync::atomic::AtomicBool,
    fail_writes: std::sync::atomic::AtomicBool,
}

impl InMemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, rows: Vec<CountRow>) {
        *self.rows.lock().expect("rows mutex poisoned") = rows;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(HashMap<i32, i64>, TimestampMs)> {
        self.writes.lock().expect("writes mutex poisoned").clone()
    }
}

#[async_trait]
impl TimeSeriesReader for InMemoryTimeSeries {
    async fn query_recent_counts(
        &self,
        _bucket_size_ms: u64,
        _lookback_ms: u64,
        batch_size: usize,
    ) -> Result<Vec<CountRow>> {
        if self.fail_reads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::ShieldError::UpstreamUnavailable(
                "simulated read failure".into(),
            ));
        }
        let rows = self.rows.lock().expect("rows mutex poisoned");
        Ok(rows.iter().take(batch_size).copied().collect())
    }
}

#[async_trait]
impl TimeSeriesWriter for InMemoryTimeSeries {
    async fn insert_counts(&self, batch: HashMap<i32, i64>, as_of: TimestampMs) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::error::ShieldError::UpstreamUnavailable(
                "simulated write failure".into(),
            ));
        }
        self.writes
            .lock()
            .expect("writes mutex poisoned")
            .push((batch, as_of));
        Ok(())
    }
}
