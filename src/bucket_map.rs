//! # BucketMap
//!
//! A concurrency-safe, bounded mapping from key `K` to a leaky
//! bucket, backed by a [`BucketsHeap`]. Acquires or creates buckets on
//! demand; evicts the stalest bucket (smallest `last_access_time`)
//! when full.
use crate::bucket::{Bucket, TimestampMs};
use crate::error::{Result, ShieldError};
use crate::heap::BucketsHeap;
use crate::metrics::{self, Counter};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Which flavor of bucket a `BucketMap` creates on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Const,
    Var,
}

#[derive(Debug, Clone, Copy)]
struct Defaults {
    capacity: u32,
    leak_interval: Duration,
}

struct Inner<K> {
    heap: BucketsHeap<K>,
    defaults: Defaults,
}

/// A bounded map of keys to leaky buckets. All mutation passes
/// through a single mutex spanning both the hash index and the
/// eviction heap; bucket operations never block, so the critical
/// section is always short.
pub struct BucketMap<K> {
    inner: Mutex<Inner<K>>,
    max_buckets: usize,
    kind: BucketKind,
    name: &'static str,
}

impl<K: Eq + Hash + Clone> BucketMap<K> {
    /// `name` is used only to label metrics/log lines (e.g. "puzzle",
    /// "portal", "authenticated", "difficulty").
    pub fn new(
        name: &'static str,
        kind: BucketKind,
        max_buckets: usize,
        capacity: u32,
        leak_interval: Duration,
    ) -> Result<Self> {
        if max_buckets == 0 {
            return Err(ShieldError::InvalidArgument(
                "max_buckets must be > 0".into(),
            ));
        }
        if capacity == 0 {
            return Err(ShieldError::InvalidArgument(
                "bucket capacity must be > 0".into(),
            ));
        }
        if leak_interval.is_zero() {
            return Err(ShieldError::InvalidArgument(
                "leak interval must be > 0".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                heap: BucketsHeap::new(),
                defaults: Defaults {
                    capacity,
                    leak_interval,
                },
            }),
            max_buckets,
            kind,
            name,
        })
    }

    fn make_bucket(&self, key: K, now: TimestampMs, defaults: Defaults) -> Result<Bucket<K>> {
        match self.kind {
            BucketKind::Const => {
                Bucket::new_const(key, defaults.capacity, defaults.leak_interval, now)
            }
            BucketKind::Var => Bucket::new_var(key, defaults.capacity, defaults.leak_interval, now),
        }
    }

    /// Add `n` to the bucket for `key` at `now`, creating it (and
    /// evicting the stalest bucket if the map is full) if it doesn't
    /// already exist. Returns `(level_before_this_call,
    /// amount_actually_admitted)`.
    pub fn update(&self, key: K, n: u32, now: TimestampMs) -> Result<(u32, u32)> {
        let mut guard = self.inner.lock().expect("bucket map mutex poisoned");
        let Inner { heap, defaults } = &mut *guard;
        let defaults = *defaults;

        if let Some(index) = heap.index_of(&key) {
            let result = heap
                .get_mut(index)
                .expect("index_of returned a valid index")
                .add(now, n)?;
            heap.fix(index);
            return Ok(result);
        }

        if heap.len() >= self.max_buckets {
            if let Some(victim) = heap.pop() {
                tracing::debug!(pool = self.name, key = ?victim.key(), "evicting stale bucket");
                metrics::Measure::inc(Counter::BucketEvicted);
            }
        }

        let mut bucket = self.make_bucket(key, now, defaults)?;
        let result = bucket.add(now, n)?;
        let index = heap.push(bucket);
        heap.fix(index);
        metrics::Measure::inc(Counter::BucketCreated);
        Ok(result)
    }

    /// Non-creating read of a bucket's current fullness; `0` if the
    /// key has never been touched.
    pub fn level(&self, key: &K, now: TimestampMs) -> u32 {
        let guard = self.inner.lock().expect("bucket map mutex poisoned");
        guard
            .heap
            .index_of(key)
            .and_then(|index| guard.heap.get(index))
            .map(|bucket| bucket.level(now))
            .unwrap_or(0)
    }

    /// Non-creating read of a bucket's reset time; `Duration::ZERO` if
    /// the key has never been touched.
    pub fn reset_time(&self, key: &K, now: TimestampMs) -> Duration {
        let guard = self.inner.lock().expect("bucket map mutex poisoned");
        guard
            .heap
            .index_of(key)
            .and_then(|index| guard.heap.get(index))
            .map(|bucket| bucket.reset_time(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Update the defaults used when creating new buckets. Existing
    /// buckets keep their current parameters until their next natural
    /// eviction; this is a deliberate design choice (no retroactive
    /// re-parameterization). Callers needing strict reconfiguration of
    /// a single bucket should use [`BucketMap::reconfigure`].
    pub fn update_limits(&self, capacity: u32, leak_interval: Duration) {
        let mut guard = self.inner.lock().expect("bucket map mutex poisoned");
        guard.defaults = Defaults {
            capacity,
            leak_interval,
        };
    }

    /// Atomically replace `capacity` and `leak_interval` on the
    /// (possibly newly created) bucket for `key`, preserving `level`
    /// and `last_access_time`. Used by the "legitimizing a client"
    /// flow: an authenticated session raises its own IP's bucket
    /// parameters for subsequent requests. Only meaningful for
    /// `Const`-flavored maps.
    pub fn reconfigure(
        &self,
        key: K,
        capacity: u32,
        leak_interval: Duration,
        now: TimestampMs,
    ) -> Result<()> {
        if self.kind != BucketKind::Const {
            return Err(ShieldError::InvalidArgument(
                "reconfigure is only supported for Const bucket maps".into(),
            ));
        }
        let mut guard = self.inner.lock().expect("bucket map mutex poisoned");
        let Inner { heap, defaults } = &mut *guard;
        let defaults = *defaults;

        let index = if let Some(index) = heap.index_of(&key) {
            index
        } else {
            if heap.len() >= self.max_buckets {
                heap.pop();
            }
            let bucket = self.make_bucket(key, now, defaults)?;
            heap.push(bucket)
        };
        heap.get_mut(index)
            .expect("index is valid by construction above")
            .reconfigure_const(capacity, leak_interval)
    }

    /// Drop every bucket, freeing the map and heap.
    pub fn reset(&self) {
        let mut guard = self.inner.lock().expect("bucket map mutex poisoned");
        guard.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("bucket map mutex poisoned").heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
