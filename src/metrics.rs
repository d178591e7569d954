//! # Metrics
//!
//! Prometheus counters/gauges for the rate-limiting and
//! difficulty-scaling core: `lazy_static`-registered collectors,
//! gathered through the standard text encoder. This module does not
//! own the HTTP `/metrics` scrape endpoint — that's the outer
//! service's job — it only registers and increments collectors.
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec,
};

lazy_static! {
    static ref BUCKETS_CREATED: IntCounter =
        register_int_counter!("shield_buckets_created_total", "Total buckets created").unwrap();
    static ref BUCKETS_EVICTED: IntCounter =
        register_int_counter!("shield_buckets_evicted_total", "Total buckets evicted for staleness")
            .unwrap();
    static ref REQUESTS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "shield_requests_rejected_total",
        "Total requests rejected by the rate limiter",
        &["pool"]
    )
    .unwrap();
    static ref AGGREGATION_FLUSHED: IntCounter = register_int_counter!(
        "shield_aggregation_batches_flushed_total",
        "Total aggregation batches successfully flushed"
    )
    .unwrap();
    static ref AGGREGATION_DROPPED: IntCounter = register_int_counter!(
        "shield_aggregation_batches_dropped_total",
        "Total aggregation batches dropped after exceeding max size"
    )
    .unwrap();
    static ref LEVEL_TICK_FAILURES: IntCounter = register_int_counter!(
        "shield_level_controller_tick_failures_total",
        "Total level-controller ticks that failed to query the time series"
    )
    .unwrap();
    static ref DIFFICULTY_LEVELS: IntGaugeVec = register_int_gauge_vec!(
        "shield_difficulty_level",
        "Current published difficulty level per property",
        &["property"]
    )
    .unwrap();
}

/// Counter kinds the core increments.
pub enum Counter {
    BucketCreated,
    BucketEvicted,
    RequestRejected(&'static str),
    AggregationFlushed,
    AggregationDropped,
    LevelTickFailed,
}

/// Increments and gauge-sets, collected behind one entry point.
pub struct Measure;

impl Measure {
    pub fn inc(counter: Counter) {
        match counter {
            Counter::BucketCreated => BUCKETS_CREATED.inc(),
            Counter::BucketEvicted => BUCKETS_EVICTED.inc(),
            Counter::RequestRejected(pool) => {
                REQUESTS_REJECTED.with_label_values(&[pool]).inc()
            }
            Counter::AggregationFlushed => AGGREGATION_FLUSHED.inc(),
            Counter::AggregationDropped => AGGREGATION_DROPPED.inc(),
            Counter::LevelTickFailed => LEVEL_TICK_FAILURES.inc(),
        }
    }

    pub fn set_difficulty_level(property_id: i32, level: u8) {
        DIFFICULTY_LEVELS
            .with_label_values(&[&property_id.to_string()])
            .set(level as i64);
    }

    /// Gather metrics in Prometheus text exposition format.
    pub fn gather() -> Vec<u8> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }
}
