//! # AggregationWorker
//!
//! Batches puzzle-creation events into the time-series store without
//! blocking the request hot path. The lifecycle shape — a
//! `CancellationToken` for cooperative shutdown, a tracked
//! `JoinHandle`, and a bounded join-timeout on `stop` — follows
//! `PHiBBeRR-PulseArc`'s `OutboxWorker`
//! (`crates/infra/src/sync/outbox_worker.rs`).
use crate::bucket::TimestampMs;
use crate::metrics::{self, Counter};
use crate::time_series::TimeSeriesWriter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A puzzle-creation event, as emitted by the request hot path.
#[derive(Debug, Clone)]
pub struct PuzzleCreationEvent {
    pub property_id: i32,
    pub user_id: Option<String>,
    pub timestamp: TimestampMs,
}

/// Configuration for the aggregation worker.
#[derive(Debug, Clone, Copy)]
pub struct AggregationConfig {
    pub trigger_size: usize,
    pub flush_interval: Duration,
    pub max_batch_size: usize,
    pub join_timeout: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            trigger_size: 200,
            flush_interval: Duration::from_secs(5),
            max_batch_size: 10_000,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// In-memory accumulator of `property-id -> count`, flushed on size
/// threshold or time tick. `pending` tracks the total entry count
/// (not the number of distinct properties): a prolonged outage only
/// grows the batch up to `max_batch_size` before it's dropped.
#[derive(Debug, Default)]
struct AggregationBatch {
    counts: HashMap<i32, i64>,
    pending: usize,
}

impl AggregationBatch {
    fn record(&mut self, property_id: i32) {
        *self.counts.entry(property_id).or_insert(0) += 1;
        self.pending += 1;
    }

    fn clear(&mut self) {
        self.counts.clear();
        self.pending = 0;
    }

    fn is_empty(&self) -> bool {
        self.pending == 0
    }
}

/// Background batcher with an explicit start/stop lifecycle.
pub struct AggregationWorker {
    writer: Arc<dyn TimeSeriesWriter>,
    config: AggregationConfig,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl AggregationWorker {
    pub fn new(writer: Arc<dyn TimeSeriesWriter>, config: AggregationConfig) -> Self {
        Self {
            writer,
            config,
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Start consuming `rx` on a background task. `rx` is consumed;
    /// calling `start` again after a prior `stop` requires a fresh
    /// receiver.
    pub fn start(&mut self, rx: mpsc::Receiver<PuzzleCreationEvent>) {
        let writer = self.writer.clone();
        let config = self.config;
        let cancellation = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(Self::run(rx, writer, config, cancellation)));
    }

    async fn run(
        mut rx: mpsc::Receiver<PuzzleCreationEvent>,
        writer: Arc<dyn TimeSeriesWriter>,
        config: AggregationConfig,
        cancellation: CancellationToken,
    ) {
        let mut batch = AggregationBatch::default();
        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so the real
        // cadence is `flush_interval` from here.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("aggregation worker cancelled; discarding in-flight batch");
                    return;
                }
                maybe_event = rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            batch.record(event.property_id);
                            if batch.pending > config.max_batch_size {
                                tracing::warn!(pending = batch.pending, "aggregation batch exceeded max size, dropping");
                                metrics::Measure::inc(Counter::AggregationDropped);
                                batch.clear();
                                continue;
                            }
                            if batch.pending >= config.trigger_size {
                                Self::try_flush(&writer, &mut batch).await;
                            }
                        }
                        None => {
                            tracing::info!("aggregation event channel closed; exiting");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        Self::try_flush(&writer, &mut batch).await;
                    }
                }
            }
        }
    }

    async fn try_flush(writer: &Arc<dyn TimeSeriesWriter>, batch: &mut AggregationBatch) {
        let as_of = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as TimestampMs)
            .unwrap_or(0);
        match writer.insert_counts(batch.counts.clone(), as_of).await {
            Ok(()) => {
                metrics::Measure::inc(Counter::AggregationFlushed);
                batch.clear();
            }
            Err(err) => {
                tracing::warn!(error = %err, "aggregation flush failed, retaining batch");
            }
        }
    }

    /// Request cooperative shutdown and wait (bounded by
    /// `join_timeout`) for the background task to exit. Any in-flight
    /// batch is discarded — it's telemetry, not authoritative state.
    pub async fn stop(&mut self) {
        self.cancellation.cancel();
        if let Some(handle) = self.task_handle.take() {
            if tokio::time::timeout(self.config.join_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!("aggregation worker did not exit within join timeout");
            }
        }
    }
}
