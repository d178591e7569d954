//! # Config
//!
//! The configuration surface recognized by this core, deserialized
//! from TOML the same way `banhammer::Config` parses `Config.toml`.
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn deserialize_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Ok(Duration::from_secs_f64(secs))
}

fn serialize_duration_secs<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(d.as_secs_f64())
}

/// Full configuration surface recognized by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the trusted client-IP header; empty means use the
    /// transport-level remote address.
    #[serde(default)]
    pub rate_limit_header: String,

    /// Limiter for puzzle issuance (tighter).
    pub puzzle_bucket_capacity: u32,
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub puzzle_bucket_interval: Duration,

    /// Limiter for general/portal endpoints (looser).
    pub default_bucket_capacity: u32,
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub default_bucket_interval: Duration,

    /// Elevated parameters applied after authentication
    /// ("legitimizing a client").
    pub authenticated_bucket_capacity: u32,
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub authenticated_bucket_interval: Duration,

    /// Per-pool bucket map capacity.
    pub max_buckets: usize,

    /// The time window for `Var` buckets in the level controller
    /// (e.g. 5 minutes).
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub property_bucket_size: Duration,

    /// How many recent rows to read per level-controller tick.
    pub levels_batch_size: usize,

    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub aggregation_flush_interval: Duration,
    pub aggregation_trigger_size: usize,
    pub aggregation_max_batch_size: usize,

    /// How often the level controller re-queries the time series
    /// store.
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub level_controller_interval: Duration,
    /// Maximum jitter added to `level_controller_interval` to avoid a
    /// thundering herd of simultaneous time-series queries.
    #[serde(
        deserialize_with = "deserialize_duration_secs",
        serialize_with = "serialize_duration_secs"
    )]
    pub level_controller_jitter: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rate_limit_header: String::new(),
            puzzle_bucket_capacity: 20,
            puzzle_bucket_interval: Duration::from_secs(60),
            default_bucket_capacity: 200,
            default_bucket_interval: Duration::from_secs(60),
            authenticated_bucket_capacity: 1000,
            authenticated_bucket_interval: Duration::from_secs(60),
            max_buckets: 100_000,
            property_bucket_size: Duration::from_secs(300),
            levels_batch_size: 100,
            aggregation_flush_interval: Duration::from_secs(5),
            aggregation_trigger_size: 200,
            aggregation_max_batch_size: 10_000,
            level_controller_interval: Duration::from_secs(30),
            level_controller_jitter: Duration::from_secs(3),
        }
    }
}
