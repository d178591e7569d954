//! # LevelController & DifficultyLookup
//!
//! Periodically pulls recent per-property request counts from the
//! time-series collaborator, folds them into a per-property `Var`
//! bucket, and converts each bucket's smoothed leak rate into a
//! published difficulty level. The periodic-tick-with-jitter shape is
//! learned from `antifuchs-ratelimit_meter`'s `jitter.rs`; the
//! publish-by-pointer-swap uses `RwLock<Arc<_>>` in place of an
//! unlisted atomic-pointer crate.
use crate::bucket::Bucket;
use crate::metrics::{self, Counter};
use crate::time_series::TimeSeriesReader;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One of the four tunable response curves a property's difficulty
/// can follow as traffic grows. `growth_factor` defaults are
/// documented here since they're load-bearing constants, not
/// guesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthClass {
    Constant,
    Slow,
    Medium,
    Fast,
}

impl GrowthClass {
    fn growth_factor(self) -> f64 {
        match self {
            GrowthClass::Constant => 0.0,
            GrowthClass::Slow => 0.5,
            GrowthClass::Medium => 1.0,
            GrowthClass::Fast => 2.0,
        }
    }
}

/// A property's configured base difficulty, chosen from three
/// named tiers rather than an arbitrary integer so operators pick
/// from a small, documented set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    Small,
    Medium,
    High,
}

impl Baseline {
    pub fn value(self) -> u8 {
        match self {
            Baseline::Small => 80,
            Baseline::Medium => 95,
            Baseline::High => 110,
        }
    }
}

/// An immutable snapshot of published difficulty levels, one per
/// property. Never mutated in place; `LevelController` publishes a
/// fresh snapshot each tick.
#[derive(Debug, Clone, Default)]
pub struct DifficultyLevels {
    levels: HashMap<i32, u8>,
}

impl DifficultyLevels {
    pub fn get(&self, property_id: i32) -> Option<u8> {
        self.levels.get(&property_id).copied()
    }
}

/// Monotonic, non-negative scalar of a bucket's current leak rate,
/// used to scale a property's growth factor against its baseline.
/// `rate.ln_1p()` flattens the curve at high traffic so `fast`-class
/// properties climb quickly at first and then level off well short of
/// the `u8` ceiling without an explicit cap until the final clamp.
fn growth_curve(leak_rate: f64) -> f64 {
    if leak_rate <= 0.0 {
        0.0
    } else {
        leak_rate.ln_1p() * 10.0
    }
}

/// Per-property configuration the controller needs to convert a leak
/// rate into a published level.
#[derive(Debug, Clone, Copy)]
pub struct PropertyConfig {
    pub growth_class: GrowthClass,
    pub baseline: Baseline,
}

/// Read interface consumed by the puzzle issuer. Lock-free: readers
/// clone the published `Arc` under a read lock held only for the
/// load, so a lookup never blocks a concurrent publish.
pub struct DifficultyLookup {
    snapshot: Arc<RwLock<Arc<DifficultyLevels>>>,
}

impl DifficultyLookup {
    /// `growth_class` is accepted for parity with the property's
    /// configuration but unused here: it already shaped the published
    /// level when the controller computed it, so the read path only
    /// ever needs the snapshot and the fallback baseline.
    pub fn lookup(&self, property_id: i32, _growth_class: GrowthClass, baseline: Baseline) -> u8 {
        let snapshot = self.snapshot.read().expect("snapshot lock poisoned").clone();
        snapshot.get(property_id).unwrap_or(baseline.value())
    }
}

/// Configuration for the controller's tick cadence.
#[derive(Debug, Clone, Copy)]
pub struct LevelControllerConfig {
    pub tick_interval: Duration,
    pub jitter: Duration,
    pub bucket_size: Duration,
    pub lookback: Duration,
    pub batch_size: usize,
    pub query_timeout: Duration,
}

impl Default for LevelControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            jitter: Duration::from_secs(3),
            bucket_size: Duration::from_secs(300),
            lookback: Duration::from_secs(300),
            batch_size: 100,
            query_timeout: Duration::from_secs(8),
        }
    }
}

/// Background worker that turns recent traffic into published
/// difficulty levels.
pub struct LevelController {
    reader: Arc<dyn TimeSeriesReader>,
    config: LevelControllerConfig,
    properties: HashMap<i32, PropertyConfig>,
    snapshot: Arc<RwLock<Arc<DifficultyLevels>>>,
    cancellation: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl LevelController {
    pub fn new(
        reader: Arc<dyn TimeSeriesReader>,
        config: LevelControllerConfig,
        properties: HashMap<i32, PropertyConfig>,
    ) -> Self {
        Self {
            reader,
            config,
            properties,
            snapshot: Arc::new(RwLock::new(Arc::new(DifficultyLevels::default()))),
            cancellation: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// A read handle for the puzzle issuer, sharing this controller's
    /// published snapshot pointer.
    pub fn lookup(&self) -> DifficultyLookup {
        DifficultyLookup {
            snapshot: self.snapshot.clone(),
        }
    }

    pub fn start(&mut self) {
        let reader = self.reader.clone();
        let config = self.config;
        let properties = self.properties.clone();
        let snapshot = self.snapshot.clone();
        let cancellation = self.cancellation.clone();
        self.task_handle = Some(tokio::spawn(Self::run(
            reader,
            config,
            properties,
            snapshot,
            cancellation,
        )));
    }

    async fn run(
        reader: Arc<dyn TimeSeriesReader>,
        config: LevelControllerConfig,
        properties: HashMap<i32, PropertyConfig>,
        snapshot: Arc<RwLock<Arc<DifficultyLevels>>>,
        cancellation: CancellationToken,
    ) {
        let mut buckets: HashMap<i32, Bucket<i32>> = HashMap::new();
        loop {
            let jitter = if config.jitter.is_zero() {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..=config.jitter.as_millis() as u64))
            };
            tokio::select! {
                _ = cancellation.cancelled() => {
                    tracing::info!("level controller cancelled");
                    return;
                }
                _ = tokio::time::sleep(config.tick_interval + jitter) => {}
            }

            match tokio::time::timeout(
                config.query_timeout,
                reader.query_recent_counts(
                    config.bucket_size.as_millis() as u64,
                    config.lookback.as_millis() as u64,
                    config.batch_size,
                ),
            )
            .await
            {
                Ok(Ok(rows)) => {
                    let published = Self::apply_rows(&mut buckets, &properties, rows);
                    let mut guard = snapshot.write().expect("snapshot lock poisoned");
                    *guard = Arc::new(published);
                }
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "level controller tick failed, keeping previous snapshot");
                    metrics::Measure::inc(Counter::LevelTickFailed);
                }
                Err(_) => {
                    tracing::warn!("level controller tick timed out, keeping previous snapshot");
                    metrics::Measure::inc(Counter::LevelTickFailed);
                }
            }
        }
    }

    fn apply_rows(
        buckets: &mut HashMap<i32, Bucket<i32>>,
        properties: &HashMap<i32, PropertyConfig>,
        rows: Vec<crate::time_series::CountRow>,
    ) -> DifficultyLevels {
        for row in rows {
            let bucket = buckets.entry(row.property_id).or_insert_with(|| {
                Bucket::new_var(
                    row.property_id,
                    u32::MAX,
                    Duration::from_millis(60_000),
                    row.ts,
                )
                .expect("fixed construction arguments are always valid")
            });
            let _ = bucket.add(row.ts, row.count.max(0) as u32);
        }

        let mut levels = HashMap::new();
        for (&property_id, config) in properties {
            let leak_rate = buckets.get(&property_id).map(|b| b.leak_rate()).unwrap_or(0.0);
            let baseline = config.baseline.value() as f64;
            let scaled = baseline + growth_curve(leak_rate) * config.growth_class.growth_factor();
            let level = scaled.round().clamp(1.0, 255.0) as u8;
            metrics::Measure::set_difficulty_level(property_id, level);
            levels.insert(property_id, level);
        }
        DifficultyLevels { levels }
    }

    /// Request cooperative shutdown. In-memory `Var` buckets are
    /// discarded; on next start they're rebuilt from the time series.
    pub async fn stop(&mut self, join_timeout: Duration) {
        self.cancellation.cancel();
        if let Some(handle) = self.task_handle.take() {
            if tokio::time::timeout(join_timeout, handle).await.is_err() {
                tracing::warn!("level controller did not exit within join timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_series::{CountRow, InMemoryTimeSeries};

    fn properties() -> HashMap<i32, PropertyConfig> {
        let mut map = HashMap::new();
        map.insert(
            1,
            PropertyConfig {
                growth_class: GrowthClass::Slow,
                baseline: Baseline::Small,
            },
        );
        map.insert(
            2,
            PropertyConfig {
                growth_class: GrowthClass::Fast,
                baseline: Baseline::High,
            },
        );
        map
    }

    #[test]
    fn unconfigured_property_falls_back_to_baseline() {
        let controller = LevelController::new(
            Arc::new(InMemoryTimeSeries::new()),
            LevelControllerConfig::default(),
            properties(),
        );
        let lookup = controller.lookup();
        assert_eq!(lookup.lookup(99, GrowthClass::Constant, Baseline::Medium), 95);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_5_low_traffic_stays_near_baseline_high_traffic_grows_past_it() {
        let store = Arc::new(InMemoryTimeSeries::new());
        let mut rows = Vec::new();
        for i in 0..5 {
            rows.push(CountRow {
                property_id: 1,
                ts: i * 60_000,
                count: 1,
            });
        }
        for i in 0..5 {
            rows.push(CountRow {
                property_id: 2,
                ts: i * 60_000,
                count: 1000,
            });
        }
        store.seed(rows);

        let mut controller = LevelController::new(
            store,
            LevelControllerConfig {
                tick_interval: Duration::from_millis(10),
                jitter: Duration::ZERO,
                ..LevelControllerConfig::default()
            },
            properties(),
        );
        let lookup = controller.lookup();
        controller.start();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let p1 = lookup.lookup(1, GrowthClass::Slow, Baseline::Small);
        let p2 = lookup.lookup(2, GrowthClass::Fast, Baseline::High);
        assert!((p1 as i32 - 80).abs() <= 10, "P1 level {p1} should stay near baseline 80");
        assert!(p2 > 110, "P2 level {p2} should grow past baseline 110");
        assert!(p2 <= 255);

        controller.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_failure_keeps_the_previous_snapshot() {
        let store = Arc::new(InMemoryTimeSeries::new());
        store.seed(vec![CountRow {
            property_id: 1,
            ts: 0,
            count: 5,
        }]);

        let mut controller = LevelController::new(
            store.clone(),
            LevelControllerConfig {
                tick_interval: Duration::from_millis(10),
                jitter: Duration::ZERO,
                ..LevelControllerConfig::default()
            },
            properties(),
        );
        let lookup = controller.lookup();
        controller.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = lookup.lookup(1, GrowthClass::Slow, Baseline::Small);

        store.set_fail_reads(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = lookup.lookup(1, GrowthClass::Slow, Baseline::Small);
        assert_eq!(before, after);

        controller.stop(Duration::from_secs(1)).await;
    }
}
