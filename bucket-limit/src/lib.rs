//! # bucket-limit
//!
//! `bucket-limit` tracks the rate limits a REST API reports through its
//! response headers, so that clients can hold requests back instead of
//! drawing 429s.
//!
//! ## Core Philosophy
//!
//! The server is the source of truth. Nothing is predicted ahead of the first
//! response: a bucket starts out unknown and only locks once a response says
//! it is exhausted, or once a 429 says so explicitly.
//!
//! ## Key Concepts
//!
//! * **Route**: method, path template and parameters. Each route maps onto a
//!   [`BucketKey`]; routes with equal keys are throttled together.
//! * **Bucket**: the per-key state (`limit`, `remaining`, reset deadline,
//!   lock) plus a FIFO queue. One request per bucket is in flight at a time,
//!   which keeps dispatch in submission order.
//! * **Global lock**: a single process-wide gate engaged by global 429s.
//! * **Registry**: creates buckets on demand and evicts idle ones.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//!
//! use bucket_limit::BucketRegistry;
//! use bucket_limit::Method;
//! use bucket_limit::RateLimitHeaders;
//! use bucket_limit::Route;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = BucketRegistry::new(Duration::from_secs(60));
//! let route = Route::new(Method::Post, "/channels/{channel_id}/messages").param("channel_id", 1);
//!
//! let bucket = registry.get_or_create(&route.bucket_key());
//! let permit = bucket.acquire().await.unwrap();
//! permit.begin_send();
//! // ... send the request, then fold the response in:
//! permit.record(&RateLimitHeaders::default(), 0, false, false);
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

mod bucket;
mod global;
pub mod headers;
mod registry;
pub mod route;

pub use bucket::Admission;
pub use bucket::Bucket;
pub use bucket::BucketPermit;
pub use bucket::BucketSnapshot;
pub use global::GlobalAdmission;
pub use global::GlobalLimiter;
pub use global::GlobalTicket;
pub use headers::RateLimitHeaders;
pub use headers::RetryAfterUnit;
pub use registry::BucketRegistry;
pub use route::BucketKey;
pub use route::Method;
pub use route::Route;
pub use route::RouteError;

/// Reasons a queued request can fail to be admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    /// The queue entry was dropped by the limiter before its turn came.
    #[error("rate limit queue closed before admission")]
    Closed,
}

/// Spawn onto the current runtime, if there is one.
pub(crate) fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(future))
}

/// Longest lock a single response can impose.
pub const MAX_LOCK: Duration = Duration::from_secs(24 * 60 * 60);

/// `from + wait`, with `wait` capped at [`MAX_LOCK`].
pub(crate) fn deadline(from: Instant, wait: Duration) -> Instant {
    from + wait.min(MAX_LOCK)
}
