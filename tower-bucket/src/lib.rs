//! # Tower Bucket
//!
//! `tower-bucket` puts a REST client's requests through the rate limits the
//! server announces, on top of any [Tower](https://github.com/tower-rs/tower)
//! HTTP transport.
//!
//! ## How requests flow
//!
//! 1. **Routing**: a [`Route`] maps onto a bucket key. Routes sharing a key
//!    share a FIFO queue and are sent one at a time.
//! 2. **Global gate**: while a global 429 is in force nothing is sent from
//!    any bucket; arrivals wait in one process-wide queue.
//! 3. **Send**: the transport call is bounded by the configured timeout.
//!    Rate-limit headers of every response are folded into the bucket, which
//!    locks itself until its reset once it reports nothing remaining.
//! 4. **Outcome**: 429s requeue the request at the front of its bucket (or
//!    the global queue) and are never returned to the caller. Transient
//!    statuses are retried with linear backoff. Anything else resolves the
//!    request.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use tower::BoxError;
//! use tower::service_fn;
//! use tower_bucket::Method;
//! use tower_bucket::RequestSpec;
//! use tower_bucket::Route;
//! use tower_bucket::Scheduler;
//! use tower_bucket::SchedulerConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), BoxError> {
//! let transport = service_fn(|_req: http::Request<Bytes>| async {
//!     Ok::<_, BoxError>(http::Response::new(Bytes::new()))
//! });
//! let scheduler = Scheduler::new(transport, SchedulerConfig::new().with_token("Bot token"));
//!
//! let route = Route::new(Method::Post, "/channels/{channel_id}/messages")
//!     .param("channel_id", 41771983423143937u64);
//! let spec = RequestSpec::new().with_json(&serde_json::json!({ "content": "hello" }))?;
//! let response = scheduler.submit(route, spec).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod executor;
mod layer;
mod request;
mod service;


pub use bucket_limit::BucketKey;
pub use bucket_limit::BucketSnapshot;
pub use bucket_limit::Method;
pub use bucket_limit::RetryAfterUnit;
pub use bucket_limit::Route;
pub use bucket_limit::RouteError;
pub use config::SchedulerConfig;
pub use error::AbortReason;
pub use error::HttpStatusError;
pub use error::SchedulerError;
pub use layer::SchedulerLayer;
pub use request::AUDIT_LOG_REASON;
pub use request::RequestBody;
pub use request::RequestSpec;
pub use service::ResponseFuture;
pub use service::RoutedRequest;
pub use service::Scheduler;
