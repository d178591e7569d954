//! # IPBuckets
//!
//! A `BucketMap` specialized to client-IP keys: extracts the client
//! IP from a configured trusted header (with a safe fallback to the
//! transport-level remote address), and feeds `Update` on each HTTP
//! request.
use crate::bucket::TimestampMs;
use crate::bucket_map::{BucketKind, BucketMap};
use crate::error::Result;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// The key `IPBuckets` indexes by. `Unknown` is a single shared
/// bucket used when no client identity can be determined at all, so
/// abuse from misconfigured edges is still capped without blocking
/// every anonymous caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    Addr(IpAddr),
    Unknown,
}

/// Extract the client key for a request:
/// 1. If `header_name` is non-empty and present, use its value.
/// 2. Else use the transport-level remote address, stripped of port.
/// 3. If the result is empty/unparsable, fall back to `Unknown`.
pub fn extract_client_key(
    header_name: &str,
    header_value: Option<&str>,
    remote_addr: Option<SocketAddr>,
) -> ClientKey {
    if !header_name.is_empty() {
        if let Some(value) = header_value {
            let trimmed = value.trim();
            if let Ok(addr) = trimmed.parse::<IpAddr>() {
                return ClientKey::Addr(addr);
            }
            // Header present but unparsable as a bare IP (e.g. a
            // comma-separated X-Forwarded-For list); take the first
            // hop, which is the one nearest the client.
            if let Some(first) = trimmed.split(',').next() {
                if let Ok(addr) = first.trim().parse::<IpAddr>() {
                    return ClientKey::Addr(addr);
                }
            }
        }
    }
    match remote_addr {
        Some(addr) => ClientKey::Addr(addr.ip()),
        None => ClientKey::Unknown,
    }
}

/// A `BucketMap<ClientKey>` wired for per-client-IP rate limiting.
pub struct IpBuckets {
    map: BucketMap<ClientKey>,
    header_name: String,
}

impl IpBuckets {
    pub fn new(
        name: &'static str,
        header_name: impl Into<String>,
        max_buckets: usize,
        capacity: u32,
        leak_interval: Duration,
    ) -> Result<Self> {
        Ok(Self {
            map: BucketMap::new(name, BucketKind::Const, max_buckets, capacity, leak_interval)?,
            header_name: header_name.into(),
        })
    }

    pub fn header_name(&self) -> &str {
        &self.header_name
    }

    /// Extract the key for this request and feed `Update`.
    pub fn update_for_request(
        &self,
        header_value: Option<&str>,
        remote_addr: Option<SocketAddr>,
        cost: u32,
        now: TimestampMs,
    ) -> Result<(ClientKey, u32, u32)> {
        let key = extract_client_key(&self.header_name, header_value, remote_addr);
        let (prev, added) = self.map.update(key.clone(), cost, now)?;
        Ok((key, prev, added))
    }

    pub fn level(&self, key: &ClientKey, now: TimestampMs) -> u32 {
        self.map.level(key, now)
    }

    pub fn reset_time(&self, key: &ClientKey, now: TimestampMs) -> Duration {
        self.map.reset_time(key, now)
    }

    /// "Legitimizing" a client: raise the capacity/interval for
    /// `key`'s bucket, preserving its current level.
    pub fn update_limits_for_key(
        &self,
        key: ClientKey,
        capacity: u32,
        leak_interval: Duration,
        now: TimestampMs,
    ) -> Result<()> {
        self.map.reconfigure(key, capacity, leak_interval, now)
    }

    pub fn update_defaults(&self, capacity: u32, leak_interval: Duration) {
        self.map.update_limits(capacity, leak_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str) -> SocketAddr {
        format!("{ip}:12345").parse().unwrap()
    }

    #[test]
    fn uses_trusted_header_when_configured() {
        let key = extract_client_key("X-Forwarded-For", Some("203.0.113.7"), Some(addr("10.0.0.1")));
        assert_eq!(key, ClientKey::Addr("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn takes_first_hop_of_forwarded_for_list() {
        let key = extract_client_key(
            "X-Forwarded-For",
            Some("203.0.113.7, 70.41.3.18, 150.172.238.178"),
            None,
        );
        assert_eq!(key, ClientKey::Addr("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn falls_back_to_remote_addr_when_header_not_configured() {
        let key = extract_client_key("", Some("203.0.113.7"), Some(addr("10.0.0.1")));
        assert_eq!(key, ClientKey::Addr("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn falls_back_to_unknown_when_nothing_resolves() {
        let key = extract_client_key("X-Forwarded-For", None, None);
        assert_eq!(key, ClientKey::Unknown);
    }

    #[test]
    fn scenario_4_ten_requests_admitted_eleventh_throttled() {
        let buckets = IpBuckets::new("puzzle", "X-Forwarded-For", 100, 10, Duration::from_secs(2))
            .unwrap();
        let mut last_key = None;
        for i in 0..10u64 {
            let (key, _prev, added) = buckets
                .update_for_request(Some("203.0.113.7"), None, 1, i * 10)
                .unwrap();
            assert_eq!(added, 1);
            last_key = Some(key);
        }
        let key = last_key.unwrap();
        let (_k2, _prev, added) = buckets
            .update_for_request(Some("203.0.113.7"), None, 1, 1000)
            .unwrap();
        assert_eq!(added, 0);

        // ResetTime(now) * leakRate ≈ Level(now) within rounding.
        let level = buckets.level(&key, 1000) as f64;
        let retry_after_secs = buckets.reset_time(&key, 1000).as_secs_f64();
        let leak_rate_per_sec = 1.0 / 2.0; // 1 unit per 2s leak interval
        assert!((retry_after_secs * leak_rate_per_sec - level).abs() < 0.01);
    }
}
