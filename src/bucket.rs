//! # Bucket
//!
//! Contains the leaky bucket primitive in its two flavors, `Const`
//! (fixed leak rate) and `Var` (leak rate adapts to a running
//! time-windowed mean of the values added).
//!
//! Bucket can:
//! - fill (`add`)
//! - leak (implicitly, computed lazily on read)
//! - overflow (capped `add`)
//!
//! The level is always `>= 0` and `<= capacity`.
use crate::error::{Result, ShieldError};
use std::time::Duration;

/// Millisecond-resolution timestamp, counted from an arbitrary fixed
/// epoch (in production, `UNIX_EPOCH`). Using a plain integer instead
/// of `std::time::Instant`/`SystemTime` keeps the leak arithmetic in
/// signed-free, easily testable space and lets callers feed
/// historical ("past event") timestamps directly.
pub type TimestampMs = u64;

/// Rounds half up: `floor(x + 0.5)`. This is the single tie-break rule
/// the whole bucket subsystem follows.
fn round_half_up(x: f64) -> u64 {
    (x + 0.5).floor() as u64
}

/// The two bucket flavors. `Const` leaks at a fixed `1 / leak_interval`
/// rate; `Var` leaks at an adaptive rate tracked as a running
/// time-windowed mean of added values.
#[derive(Debug, Clone, PartialEq)]
enum Variant {
    Const {
        leak_interval_ms: u64,
    },
    Var {
        leak_interval_ms: u64,
        leak_rate: f64,
        pending_sum: i64,
        count: u64,
    },
}

/// A single leaky bucket, exclusively owned by its `BucketMap`.
///
/// `heap_index` is maintained solely by `BucketsHeap`; `-1` means the
/// bucket is not currently stored in a heap.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket<K> {
    key: K,
    capacity: u32,
    level: u32,
    last_access_time: TimestampMs,
    heap_index: i64,
    strict_monotonic_time: bool,
    variant: Variant,
}

impl<K: Clone> Bucket<K> {
    /// Construct a `Const` bucket: leaks one unit every `leak_interval`.
    pub fn new_const(
        key: K,
        capacity: u32,
        leak_interval: Duration,
        now: TimestampMs,
    ) -> Result<Self> {
        Self::new_const_strict(key, capacity, leak_interval, now, false)
    }

    /// As [`Bucket::new_const`], but when `strict_monotonic_time` is
    /// true, `add` with `now < last_access_time` returns
    /// [`ShieldError::PastEvent`] instead of silently accepting.
    pub fn new_const_strict(
        key: K,
        capacity: u32,
        leak_interval: Duration,
        now: TimestampMs,
        strict_monotonic_time: bool,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(ShieldError::InvalidArgument(
                "bucket capacity must be > 0".into(),
            ));
        }
        let leak_interval_ms = leak_interval.as_millis() as u64;
        if leak_interval_ms == 0 {
            return Err(ShieldError::InvalidArgument(
                "leak interval must be > 0".into(),
            ));
        }
        Ok(Self {
            key,
            capacity,
            level: 0,
            last_access_time: now,
            heap_index: -1,
            strict_monotonic_time,
            variant: Variant::Const { leak_interval_ms },
        })
    }

    /// Construct a `Var` bucket: leaks at an adaptive rate, computed
    /// as a running time-windowed mean of added values.
    pub fn new_var(
        key: K,
        capacity: u32,
        leak_interval: Duration,
        now: TimestampMs,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(ShieldError::InvalidArgument(
                "bucket capacity must be > 0".into(),
            ));
        }
        let leak_interval_ms = leak_interval.as_millis() as u64;
        if leak_interval_ms == 0 {
            return Err(ShieldError::InvalidArgument(
                "leak interval must be > 0".into(),
            ));
        }
        Ok(Self {
            key,
            capacity,
            level: 0,
            last_access_time: Self::align(now, leak_interval_ms),
            heap_index: -1,
            strict_monotonic_time: false,
            variant: Variant::Var {
                leak_interval_ms,
                leak_rate: 0.0,
                pending_sum: 0,
                count: 0,
            },
        })
    }

    fn align(now: TimestampMs, leak_interval_ms: u64) -> TimestampMs {
        now - (now % leak_interval_ms)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn last_access_time(&self) -> TimestampMs {
        self.last_access_time
    }

    pub fn heap_index(&self) -> i64 {
        self.heap_index
    }

    /// Mutated only by `BucketsHeap`.
    pub(crate) fn set_heap_index(&mut self, index: i64) {
        self.heap_index = index;
    }

    /// Replace `capacity` and the leak interval of a `Const` bucket
    /// in place. `level` and `last_access_time` are preserved (the
    /// level is clamped into the new capacity). Used by the
    /// "legitimizing a client" flow and by
    /// `BucketMap::update_limits`'s eventual-reconfiguration path.
    pub fn reconfigure_const(&mut self, capacity: u32, leak_interval: Duration) -> Result<()> {
        if capacity == 0 {
            return Err(ShieldError::InvalidArgument(
                "bucket capacity must be > 0".into(),
            ));
        }
        let leak_interval_ms = leak_interval.as_millis() as u64;
        if leak_interval_ms == 0 {
            return Err(ShieldError::InvalidArgument(
                "leak interval must be > 0".into(),
            ));
        }
        self.capacity = capacity;
        self.level = self.level.min(capacity);
        self.variant = Variant::Const { leak_interval_ms };
        Ok(())
    }

    /// The adaptive leak rate, in units per `leak_interval`. `1.0` for
    /// `Const` buckets (by definition: one unit per interval).
    pub fn leak_rate(&self) -> f64 {
        match &self.variant {
            Variant::Const { .. } => 1.0,
            Variant::Var { leak_rate, .. } => *leak_rate,
        }
    }

    pub fn leak_interval_ms(&self) -> u64 {
        match &self.variant {
            Variant::Const { leak_interval_ms } | Variant::Var { leak_interval_ms, .. } => {
                *leak_interval_ms
            }
        }
    }

    /// Non-mutating projection of the bucket's fullness as of `now`.
    pub fn level(&self, now: TimestampMs) -> u32 {
        let leaked = self.leaked_amount(now);
        self.level.saturating_sub(leaked as u32)
    }

    fn leaked_amount(&self, now: TimestampMs) -> u64 {
        if now <= self.last_access_time {
            return 0;
        }
        let delta_ms = now - self.last_access_time;
        match &self.variant {
            Variant::Const { leak_interval_ms } => {
                round_half_up(delta_ms as f64 / *leak_interval_ms as f64)
            }
            Variant::Var {
                leak_interval_ms,
                leak_rate,
                ..
            } => round_half_up(delta_ms as f64 / *leak_interval_ms as f64 * leak_rate),
        }
    }

    /// Time until the bucket would drain back to zero at its current
    /// leak rate, used to populate `Retry-After`.
    pub fn reset_time(&self, now: TimestampMs) -> Duration {
        let rate = self.leak_rate();
        if rate <= 0.0 {
            return Duration::MAX;
        }
        let level = self.level(now) as f64;
        let intervals = level / rate;
        Duration::from_secs_f64(intervals * self.leak_interval_ms() as f64 / 1000.0)
    }

    /// Add `n` to the bucket. Returns `(level_before_this_call,
    /// amount_actually_admitted)`.
    pub fn add(&mut self, now: TimestampMs, n: u32) -> Result<(u32, u32)> {
        match self.variant {
            Variant::Const { .. } => self.add_const(now, n),
            Variant::Var { .. } => Ok(self.add_var(now, n)),
        }
    }

    fn add_const(&mut self, now: TimestampMs, n: u32) -> Result<(u32, u32)> {
        let prev_level = self.level;
        if now < self.last_access_time {
            if self.strict_monotonic_time {
                return Err(ShieldError::PastEvent);
            }
            // Past event: never regresses last_access_time, never leaks.
            let curr = self.level;
            let next = (curr + n).min(self.capacity);
            self.level = next;
            return Ok((prev_level, next - curr));
        }

        let leaked = self.leaked_amount(now);
        if now > self.last_access_time {
            self.last_access_time = now;
        }
        let curr = self.level.saturating_sub(leaked as u32);
        let next = curr.saturating_add(n).min(self.capacity);
        self.level = next;
        Ok((prev_level, next - curr))
    }

    fn add_var(&mut self, now: TimestampMs, n: u32) -> (u32, u32) {
        let (leak_interval_ms, leak_rate) = match &self.variant {
            Variant::Var {
                leak_interval_ms,
                leak_rate,
                ..
            } => (*leak_interval_ms, *leak_rate),
            Variant::Const { .. } => unreachable!(),
        };

        let now = Self::align(now, leak_interval_ms);
        let prev_level = self.level;

        // delta_seconds here means "delta in units of leak_interval",
        // and may be negative for past events (they never advance
        // last_access_time).
        let delta_intervals: i64 = if now >= self.last_access_time {
            ((now - self.last_access_time) / leak_interval_ms) as i64
        } else {
            -(((self.last_access_time - now) / leak_interval_ms) as i64)
        };

        // Leak using the *current* leak rate, before recomputing it.
        let leaked = if delta_intervals > 0 {
            round_half_up(delta_intervals as f64 * leak_rate)
        } else {
            0
        };
        let curr = self.level.saturating_sub(leaked as u32);
        let next = curr.saturating_add(n).min(self.capacity);
        self.level = next;

        if let Variant::Var { pending_sum, .. } = &mut self.variant {
            *pending_sum += n as i64;
        }

        if delta_intervals.unsigned_abs() >= 1 {
            if let Variant::Var {
                pending_sum,
                count,
                leak_rate,
                ..
            } = &mut self.variant
            {
                let (new_count, wrapped) = count.overflowing_add(1);
                if wrapped {
                    *count = 1;
                    *leak_rate = 0.0;
                } else {
                    *count = new_count;
                }
                // mean := mean + (pendingSum - Δseconds·mean) / (count + Δseconds)
                let delta_f = delta_intervals as f64;
                let denom = *count as f64 + delta_f;
                if denom != 0.0 {
                    *leak_rate += (*pending_sum as f64 - delta_f * *leak_rate) / denom;
                }
                *pending_sum = 0;
            }
            if delta_intervals > 0 {
                self.last_access_time = now;
            }
        }

        (prev_level, next - curr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn const_bucket_starts_empty() {
        let b = Bucket::<&str>::new_const("a", 10, SEC, 0).unwrap();
        assert_eq!(b.level(12345), 0);
    }

    #[test]
    fn const_bucket_rejects_zero_capacity() {
        assert!(Bucket::<&str>::new_const("a", 0, SEC, 0).is_err());
    }

    #[test]
    fn const_bucket_rejects_zero_interval() {
        assert!(Bucket::<&str>::new_const("a", 10, Duration::ZERO, 0).is_err());
    }

    #[test]
    fn const_bucket_scenario_1() {
        // cap=10, interval=1s, t0=0.
        let mut b = Bucket::new_const("k", 10, SEC, 0).unwrap();
        assert_eq!(b.add(0, 5).unwrap(), (0, 5));
        let (prev, added) = b.add(500, 3).unwrap();
        assert_eq!((prev, added), (5, 3));
        b.add(2000, 10).unwrap();
        assert_eq!(b.level(2000), 10);
    }

    #[test]
    fn const_bucket_past_events_increase_monotonically() {
        let mut b = Bucket::new_const("k", u32::MAX, SEC, 1_000_000).unwrap();
        let mut prev = 0u32;
        for k in 1..=1000u64 {
            let (_prev_level, added) = b.add(1_000_000 - k * 100, 1).unwrap();
            assert_eq!(added, 1);
            let lvl = b.level(1_000_000);
            assert!(lvl > prev);
            prev = lvl;
        }
    }

    #[test]
    fn const_bucket_overflow_returns_clamped_added() {
        let mut b = Bucket::new_const("k", 10, SEC, 0).unwrap();
        let (_prev, added) = b.add(0, 15).unwrap();
        assert_eq!(added, 10);
        assert_eq!(b.level(0), 10);
    }

    #[test]
    fn const_bucket_strict_rejects_past_events() {
        let mut b = Bucket::new_const_strict("k", 10, SEC, 1000, true).unwrap();
        assert!(matches!(b.add(500, 1), Err(ShieldError::PastEvent)));
    }

    #[test]
    fn var_bucket_scenario_3() {
        let mut b = Bucket::new_var("k", 1234, SEC, 0).unwrap();
        for k in 0..10u64 {
            b.add(k * 100, 1).unwrap();
        }
        assert_eq!(b.level(0), 10);
        let (_prev, added) = b.add(1000, 1).unwrap();
        assert_eq!(added, 1);
        assert!((b.leak_rate() - 5.5).abs() < 0.01);
    }

    #[test]
    fn var_bucket_gap_handling() {
        // feeding 10 at t, 2 at t+3Δ with no events at t+Δ, t+2Δ
        let mut b = Bucket::new_var("k", u32::MAX, SEC, 0).unwrap();
        b.add(0, 10).unwrap();
        b.add(3000, 2).unwrap();
        assert!((b.leak_rate() - (10.0 + 0.0 + 0.0 + 2.0) / 4.0).abs() < 0.01);
    }

    #[test]
    fn var_bucket_converges_to_constant_rate() {
        let mut b = Bucket::new_var("k", u32::MAX, SEC, 0).unwrap();
        for k in 0..500u64 {
            b.add(k * 1000, 7).unwrap();
        }
        assert!((b.leak_rate() - 7.0).abs() < 0.5);
    }

    #[test]
    fn var_bucket_bulk_equivalence() {
        let mut bulk = Bucket::new_var("k", u32::MAX, SEC, 0).unwrap();
        bulk.add(0, 30).unwrap();

        let mut incremental = Bucket::new_var("k", u32::MAX, SEC, 0).unwrap();
        for _ in 0..3 {
            incremental.add(0, 10).unwrap();
        }

        assert_eq!(bulk.level(5000), incremental.level(5000));
    }

    #[test]
    fn reset_time_matches_level_over_rate() {
        let mut b = Bucket::new_const("k", 10, SEC, 0).unwrap();
        b.add(0, 8).unwrap();
        let rt = b.reset_time(0);
        assert!((rt.as_secs_f64() - 8.0).abs() < 0.01);
    }
}
