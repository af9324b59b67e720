use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bucket_limit::Admission;
use bucket_limit::BucketKey;
use bucket_limit::GlobalAdmission;
use bucket_limit::RateLimitHeaders;
use bucket_limit::RetryAfterUnit;
use bucket_limit::Route;
use bytes::Bytes;
use http::HeaderMap;
use http::StatusCode;
use http::header::DATE;
use opentelemetry::KeyValue;
use pin_project_lite::pin_project;
use tokio::time::Timeout;
use tokio::time::timeout;
use tower::BoxError;
use tower::Service;
use tower::ServiceExt;
use tower::util::Oneshot;
use tracing::debug;
use tracing::warn;

use crate::error::AbortReason;
use crate::error::HttpStatusError;
use crate::error::SchedulerError;
use crate::request::PreparedRequest;
use crate::request::RequestSpec;
use crate::service::Shared;

pin_project! {
    /// A transport call bounded by the configured timeout.
    pub(crate) struct SendFuture<F> {
        #[pin]
        inner: Timeout<F>,
    }
}

impl<F> Future for SendFuture<F>
where
    F: Future<Output = Result<http::Response<Bytes>, BoxError>>,
{
    type Output = Result<http::Response<Bytes>, SchedulerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(Ok(response))) => Poll::Ready(Ok(response)),
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(SchedulerError::TransportAbort(
                AbortReason::Connection(err.to_string()),
            ))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::TransportAbort(
                AbortReason::Timeout,
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A 429 as the scheduler sees it. Always resolved by requeueing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct RateLimitExceeded {
    pub(crate) retry_after: Duration,
    pub(crate) global: bool,
}

impl RateLimitExceeded {
    /// Headers win; the JSON body is the fallback, then `default`.
    pub(crate) fn from_response(
        headers: &RateLimitHeaders,
        body: &[u8],
        unit: RetryAfterUnit,
        default: Duration,
    ) -> Self {
        let json: Option<serde_json::Value> = serde_json::from_slice(body).ok();
        let field = |name: &str| json.as_ref().and_then(|value| value.get(name));

        let retry_after = headers
            .retry_after
            .or_else(|| {
                field("retry_after")
                    .and_then(serde_json::Value::as_f64)
                    .and_then(|value| unit.to_duration(value))
            })
            .unwrap_or(default);
        let global = headers.global
            || field("global")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);

        Self {
            retry_after,
            global,
        }
    }
}

/// What to do with a response.
#[derive(Debug, PartialEq)]
pub(crate) enum Decision {
    Success,
    RateLimited(RateLimitExceeded),
    Transient,
    Failed,
}

pub(crate) fn decide(
    status: StatusCode,
    headers: &RateLimitHeaders,
    body: &[u8],
    is_transient: impl Fn(StatusCode) -> bool,
    unit: RetryAfterUnit,
    default_retry_after: Duration,
) -> Decision {
    if status.is_success() {
        Decision::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        Decision::RateLimited(RateLimitExceeded::from_response(
            headers,
            body,
            unit,
            default_retry_after,
        ))
    } else if is_transient(status) {
        Decision::Transient
    } else {
        Decision::Failed
    }
}

/// Server time of a response in epoch milliseconds, falling back to the
/// local clock when `Date` is missing or malformed.
pub(crate) fn response_date(headers: &HeaderMap) -> i64 {
    headers
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| chrono::DateTime::parse_from_rfc2822(value.trim()).ok())
        .map(|date| date.timestamp_millis())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
}

/// Where a request stands in line when it is submitted.
pub(crate) enum Entry {
    /// Past the global gate and queued in its bucket.
    Bucket(Admission),
    /// Waiting for the global lock to lift.
    Global(GlobalAdmission),
}

/// Drives one request from admission to its final response.
pub(crate) struct RequestExecutor<T> {
    shared: Arc<Shared<T>>,
    route: Route,
    key: BucketKey,
    request: PreparedRequest,
    retries: u32,
}

impl<T> RequestExecutor<T>
where
    T: Service<http::Request<Bytes>, Response = http::Response<Bytes>, Error = BoxError>
        + Clone
        + Send
        + Sync
        + 'static,
    T::Future: Send,
{
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        route: Route,
        spec: RequestSpec,
    ) -> Result<Self, SchedulerError> {
        let request = PreparedRequest::build(&route, spec, &shared.config)?;
        Ok(Self {
            key: route.bucket_key(),
            shared,
            route,
            request,
            retries: 0,
        })
    }

    /// Take the request's place in line. Called at submission so the place
    /// does not depend on when the returned future is first polled.
    pub(crate) fn admit_now(&self) -> Entry {
        match self.shared.global.enqueue() {
            GlobalAdmission::Open => {
                Entry::Bucket(self.shared.registry.get_or_create(&self.key).enqueue())
            }
            queued => Entry::Global(queued),
        }
    }

    pub(crate) fn key(&self) -> &BucketKey {
        &self.key
    }

    pub(crate) async fn run(
        mut self,
        entry: Entry,
    ) -> Result<http::Response<Bytes>, SchedulerError> {
        let result = self.execute(entry).await;
        if let Err(err) = &result {
            self.shared
                .metrics
                .requests_failed
                .add(1, &[KeyValue::new("kind", err.kind())]);
        }
        result
    }

    async fn execute(
        &mut self,
        entry: Entry,
    ) -> Result<http::Response<Bytes>, SchedulerError> {
        let global = Arc::clone(&self.shared.global);
        let admission = match entry {
            Entry::Bucket(admission) => admission,
            Entry::Global(queued) => {
                debug!("waiting on global lock");
                let ticket = queued.wait().await?;
                let admission = self.shared.registry.get_or_create(&self.key).enqueue();
                drop(ticket);
                admission
            }
        };
        let mut permit = admission.wait().await?;
        let mut through_gate = false;

        loop {
            // A global 429 may have landed while this request sat in its bucket.
            if !through_gate {
                drop(global.admit().await?);
            }
            through_gate = false;

            permit.begin_send();
            let response = self.send().await?;

            let config = &self.shared.config;
            let status = response.status();
            let headers = RateLimitHeaders::parse(response.headers(), config.retry_after_unit);
            let server_now = response_date(response.headers());
            let decision = decide(
                status,
                &headers,
                response.body(),
                |status| config.is_transient(status),
                config.retry_after_unit,
                config.retry_base_delay,
            );
            permit.record(
                &headers,
                server_now,
                status == StatusCode::TOO_MANY_REQUESTS,
                self.route.is_own_reaction(),
            );

            match decision {
                Decision::Success => return Ok(response),
                Decision::RateLimited(limit) if limit.global => {
                    warn!(retry_after = ?limit.retry_after, "global rate limit hit");
                    self.shared
                        .metrics
                        .rate_limited
                        .add(1, &[KeyValue::new("scope", "global")]);
                    global.lock(limit.retry_after);
                    drop(global.requeue_front().await?);
                    through_gate = true;
                }
                Decision::RateLimited(limit) => {
                    warn!(retry_after = ?limit.retry_after, "bucket rate limit hit");
                    self.shared
                        .metrics
                        .rate_limited
                        .add(1, &[KeyValue::new("scope", "bucket")]);
                    permit = permit.requeue_front(limit.retry_after).await?;
                }
                Decision::Transient if self.retries < config.max_retries => {
                    self.retries += 1;
                    let backoff = config.retry_base_delay * self.retries;
                    warn!(%status, retry = self.retries, ?backoff, "transient failure, retrying");
                    self.shared.metrics.transient_retries.add(1, &[]);
                    tokio::time::sleep(backoff).await;
                }
                Decision::Transient => {
                    return Err(SchedulerError::RetriesExhausted {
                        retries: self.retries,
                        last: self.status_error(response),
                    });
                }
                Decision::Failed => {
                    return Err(SchedulerError::HttpStatus(self.status_error(response)));
                }
            }
        }
    }

    fn send(&self) -> SendFuture<Oneshot<T, http::Request<Bytes>>> {
        self.shared.metrics.requests_sent.add(1, &[]);
        let transport = self.shared.transport.clone();
        SendFuture {
            inner: timeout(
                self.shared.config.timeout,
                transport.oneshot(self.request.to_http()),
            ),
        }
    }

    fn status_error(&self, response: http::Response<Bytes>) -> HttpStatusError {
        let status = response.status();
        HttpStatusError::new(
            self.request.method.clone(),
            self.request.uri.path().to_string(),
            status,
            response.into_body(),
        )
    }
}
