use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use bucket_limit::BucketRegistry;
use bucket_limit::GlobalLimiter;
use bucket_limit::Route;
use bytes::Bytes;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tower::BoxError;
use tower::Service;
use tracing::Instrument;
use tracing::debug_span;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::executor::RequestExecutor;
use crate::request::RequestSpec;

/// The future returned by [`Scheduler::submit`].
pub type ResponseFuture =
    Pin<Box<dyn Future<Output = Result<http::Response<Bytes>, SchedulerError>> + Send>>;

#[derive(Clone, Debug)]
pub(crate) struct SchedulerMetrics {
    pub(crate) requests_sent: Counter<u64>,
    pub(crate) rate_limited: Counter<u64>,
    pub(crate) transient_retries: Counter<u64>,
    pub(crate) requests_failed: Counter<u64>,
}

impl SchedulerMetrics {
    fn new() -> Self {
        let meter = global::meter("rest_bucket_scheduler");
        Self {
            requests_sent: meter.u64_counter("requests_sent").build(),
            rate_limited: meter.u64_counter("rate_limited").build(),
            transient_retries: meter.u64_counter("transient_retries").build(),
            requests_failed: meter.u64_counter("requests_failed").build(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Shared<T> {
    pub(crate) transport: T,
    pub(crate) config: SchedulerConfig,
    pub(crate) registry: BucketRegistry,
    pub(crate) global: Arc<GlobalLimiter>,
    pub(crate) metrics: SchedulerMetrics,
}

/// Schedules REST requests against the rate limits the server reports.
///
/// Every submitted request is routed to the bucket its [`Route`] maps onto
/// and sent only once that bucket, and the process-wide global lock, allow
/// it. Requests of one bucket are sent one at a time in submission order;
/// requests of different buckets proceed independently.
///
/// `T` is the transport: any tower service taking an
/// `http::Request<Bytes>` to an `http::Response<Bytes>`. Clones of a
/// scheduler share all rate-limit state.
#[derive(Debug)]
pub struct Scheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new(transport: T, config: SchedulerConfig) -> Self {
        let registry = BucketRegistry::new(config.bucket_idle_ttl);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                registry,
                global: Arc::new(GlobalLimiter::new()),
                metrics: SchedulerMetrics::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// The live buckets, for inspection.
    pub fn registry(&self) -> &BucketRegistry {
        &self.shared.registry
    }

    pub fn global(&self) -> &Arc<GlobalLimiter> {
        &self.shared.global
    }
}

impl<T> Scheduler<T>
where
    T: Service<http::Request<Bytes>, Response = http::Response<Bytes>, Error = BoxError>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send,
{
    /// Submit a request and resolve with its final response.
    ///
    /// The request takes its place in line before this returns: in its
    /// bucket queue, or in the global queue while the global lock is
    /// engaged. Rate limits are absorbed: the future
    /// only fails on transport aborts, non-retryable statuses or exhausted
    /// retries. Dropping the future withdraws the request.
    pub fn submit(&self, route: Route, spec: RequestSpec) -> ResponseFuture {
        let span = debug_span!(
            "submit",
            bucket = tracing::field::Empty,
            method = %route.method(),
            template = %route.template(),
        );
        let executor = match RequestExecutor::new(Arc::clone(&self.shared), route, spec) {
            Ok(executor) => executor,
            Err(err) => {
                self.shared
                    .metrics
                    .requests_failed
                    .add(1, &[opentelemetry::KeyValue::new("kind", err.kind())]);
                return Box::pin(std::future::ready(Err(err)));
            }
        };
        span.record("bucket", tracing::field::display(executor.key()));
        let entry = span.in_scope(|| executor.admit_now());
        Box::pin(executor.run(entry).instrument(span))
    }
}

/// A route plus what to send to it; the request type of the tower
/// [`Service`] implementation of [`Scheduler`].
#[derive(Clone, Debug)]
pub struct RoutedRequest {
    pub route: Route,
    pub spec: RequestSpec,
}

impl RoutedRequest {
    pub fn new(route: Route, spec: RequestSpec) -> Self {
        Self { route, spec }
    }
}

impl<T> Service<RoutedRequest> for Scheduler<T>
where
    T: Service<http::Request<Bytes>, Response = http::Response<Bytes>, Error = BoxError>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send,
{
    type Response = http::Response<Bytes>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    // Back pressure lives in the bucket queues, not here.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RoutedRequest) -> Self::Future {
        let fut = self.submit(req.route, req.spec);
        Box::pin(async move { fut.await.map_err(|err| Box::new(err) as BoxError) })
    }
}
