//! Adaptive rate-limiting and difficulty-scaling core for a
//! privacy-preserving CAPTCHA service: a leaky-bucket engine
//! ([`bucket`], [`heap`], [`bucket_map`], [`ip_buckets`],
//! [`rate_limiter`]) and a difficulty level controller
//! ([`aggregation`], [`time_series`], [`level_controller`]) sharing a
//! common [`error`], [`config`] and [`metrics`] surface.

pub mod aggregation;
pub mod bucket;
pub mod bucket_map;
pub mod config;
pub mod error;
pub mod heap;
pub mod ip_buckets;
pub mod level_controller;
pub mod metrics;
pub mod rate_limiter;
pub mod time_series;

pub use aggregation::{AggregationConfig, AggregationWorker, PuzzleCreationEvent};
pub use bucket::{Bucket, TimestampMs};
pub use bucket_map::{BucketKind, BucketMap};
pub use config::Config;
pub use error::{Result, ShieldError};
pub use ip_buckets::{ClientKey, IpBuckets};
pub use level_controller::{
    Baseline, DifficultyLevels, DifficultyLookup, GrowthClass, LevelController,
    LevelControllerConfig, PropertyConfig,
};
pub use rate_limiter::RateLimiter;
