//! # Errors
//!
//! Error kinds for the rate-limiting and difficulty-scaling core.
use thiserror::Error;

/// Crate-wide error type.
///
/// `CapacityExceeded` is deliberately absent: an overflowing `Add` is
/// not an error, it is signaled via `added < requested` in the return
/// value of [`crate::bucket::Bucket::add`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShieldError {
    /// Construction-time misconfiguration: zero capacity, a
    /// non-positive interval, or a missing collaborator. Fatal at
    /// startup.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Raised only by buckets constructed with
    /// `strict_monotonic_time: true` when an event arrives earlier
    /// than the bucket's `last_access_time`. The default (non-strict)
    /// construction never returns this variant; it silently accepts
    /// past events per the bucket's accept-and-do-not-advance policy.
    #[error("event predates the bucket's last access time")]
    PastEvent,

    /// The time-series collaborator could not be reached or timed
    /// out. Recovered by retaining the batch (writer) or skipping the
    /// tick (reader).
    #[error("upstream time-series store unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Cooperative cancellation requested; a clean exit, not a
    /// failure.
    #[error("shutdown requested")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, ShieldError>;
