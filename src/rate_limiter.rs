//! # RateLimiter
//!
//! HTTP middleware that on each request looks up the bucket for the
//! request's rate-limit key, adds a configurable cost, and rejects
//! the request (HTTP 429) if the bucket overflowed, emitting
//! `Retry-After` computed from the bucket's current level and leak
//! rate. Wired directly against `hyper = "0.14"` rather than a
//! higher-level router crate.
use crate::bucket::TimestampMs;
use crate::ip_buckets::{ClientKey, IpBuckets};
use crate::metrics::{self, Counter};
use http::{HeaderMap, Response, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// The outcome of a rate-limit check. Distinct pools (puzzle issuance
/// vs portal/API navigation) are simply different `RateLimiter`
/// instances wrapping different `IpBuckets`, selected by the caller's
/// route wiring.
pub struct RateLimiter {
    buckets: Arc<IpBuckets>,
    cost: u32,
    pool_name: &'static str,
}

impl RateLimiter {
    pub fn new(buckets: Arc<IpBuckets>, cost: u32, pool_name: &'static str) -> Self {
        Self {
            buckets,
            cost,
            pool_name,
        }
    }

    /// Run the admission check for one request. Returns `Some(response)`
    /// to short-circuit with a `429`, or `None` to pass the request
    /// through to the downstream handler.
    ///
    /// Internal failures (there are none today short of a poisoned
    /// mutex, which this function does not attempt to recover from by
    /// design) default to fail-open: the limiter must never itself be
    /// a source of outage.
    pub fn check(
        &self,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
        now: TimestampMs,
    ) -> Option<Response<hyper::Body>> {
        let header_name = self.buckets.header_name();
        let header_value = if header_name.is_empty() {
            None
        } else {
            headers
                .get(header_name)
                .and_then(|v| v.to_str().ok())
        };

        let (key, prev, added) = match self
            .buckets
            .update_for_request(header_value, remote_addr, self.cost, now)
        {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(pool = self.pool_name, error = %err, "rate limiter check failed, failing open");
                return None;
            }
        };

        if added < self.cost {
            tracing::debug!(pool = self.pool_name, key = ?key, prev_level = prev, "rejecting request: bucket overflowed");
            metrics::Measure::inc(Counter::RequestRejected(self.pool_name));
            return Some(self.too_many_requests(&key, now));
        }

        None
    }

    fn too_many_requests(&self, key: &ClientKey, now: TimestampMs) -> Response<hyper::Body> {
        let retry_after = self.buckets.reset_time(key, now).as_secs_f64().ceil() as u64;
        Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header(http::header::RETRY_AFTER, retry_after.to_string())
            .body(hyper::Body::empty())
            .expect("well-formed response")
    }

    /// Convenience wrapper that invokes `next` transparently when the
    /// request is admitted, matching the `Handle(next) -> handler`
    /// wiring described above.
    pub async fn handle<F, Fut>(
        &self,
        req: hyper::Request<hyper::Body>,
        remote_addr: Option<SocketAddr>,
        now: TimestampMs,
        next: F,
    ) -> Response<hyper::Body>
    where
        F: FnOnce(hyper::Request<hyper::Body>) -> Fut,
        Fut: Future<Output = Response<hyper::Body>>,
    {
        match self.check(req.headers(), remote_addr, now) {
            Some(rejection) => rejection,
            None => next(req).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(capacity: u32, interval: Duration) -> RateLimiter {
        let buckets = Arc::new(
            IpBuckets::new("puzzle", "X-Forwarded-For", 100, capacity, interval).unwrap(),
        );
        RateLimiter::new(buckets, 1, "puzzle")
    }

    fn headers_with(ip: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", ip.parse().unwrap());
        headers
    }

    #[test]
    fn admits_requests_within_capacity() {
        let rl = limiter(5, Duration::from_secs(1));
        let headers = headers_with("203.0.113.7");
        for i in 0..5u64 {
            assert!(rl.check(&headers, None, i).is_none());
        }
    }

    #[test]
    fn rejects_with_429_and_retry_after_on_overflow() {
        let rl = limiter(2, Duration::from_secs(2));
        let headers = headers_with("203.0.113.7");
        assert!(rl.check(&headers, None, 0).is_none());
        assert!(rl.check(&headers, None, 0).is_none());
        let response = rl.check(&headers, None, 0).expect("third request rejected");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(http::header::RETRY_AFTER));
    }

    #[test]
    fn pool_selection_is_independent_across_limiters() {
        let puzzle = limiter(1, Duration::from_secs(60));
        let portal = limiter(100, Duration::from_secs(60));
        let headers = headers_with("203.0.113.7");
        assert!(puzzle.check(&headers, None, 0).is_none());
        assert!(puzzle.check(&headers, None, 0).is_some());
        // The portal pool is a distinct BucketMap; it hasn't seen any
        // traffic from this IP yet, so it still admits.
        assert!(portal.check(&headers, None, 0).is_none());
    }
}
