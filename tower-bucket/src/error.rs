use std::fmt;

use bucket_limit::AdmissionError;
use bucket_limit::RouteError;
use bytes::Bytes;
use http::StatusCode;

/// Why a send was abandoned before a response arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The configured timeout elapsed.
    Timeout,
    /// The transport failed; carries its `Display` representation.
    Connection(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("request timed out"),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

/// A response whose status the scheduler does not absorb.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{method} {path} failed with {status}")]
pub struct HttpStatusError {
    pub method: http::Method,
    pub path: String,
    pub status: StatusCode,
    pub body: Bytes,
    /// The body parsed as JSON, when it is JSON.
    pub json: Option<serde_json::Value>,
}

impl HttpStatusError {
    pub(crate) fn new(method: http::Method, path: String, status: StatusCode, body: Bytes) -> Self {
        let json = serde_json::from_slice(&body).ok();
        Self {
            method,
            path,
            status,
            body,
            json,
        }
    }
}

/// Errors a submitted request can fail with.
///
/// Rate limits never surface here: 429s are absorbed by requeueing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// The send was aborted by a timeout or a transport failure. Never retried.
    #[error("transport aborted: {0}")]
    TransportAbort(AbortReason),

    /// The server answered with a non-retryable error status.
    #[error(transparent)]
    HttpStatus(HttpStatusError),

    /// A transient status persisted through every retry.
    #[error("gave up after {retries} retries: {last}")]
    RetriesExhausted {
        retries: u32,
        last: HttpStatusError,
    },

    /// The route could not be rendered into a path.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The request lost its place in a rate-limit queue.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The request could not be assembled into valid HTTP.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    /// The status of the final response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus(err) => Some(err.status),
            Self::RetriesExhausted { last, .. } => Some(last.status),
            _ => None,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::TransportAbort(AbortReason::Timeout) => "timeout",
            Self::TransportAbort(AbortReason::Connection(_)) => "connection",
            Self::HttpStatus(_) => "http_status",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Route(_) => "route",
            Self::Admission(_) => "admission",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl From<http::Error> for SchedulerError {
    fn from(err: http::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_parses_json_body() {
        let err = HttpStatusError::new(
            http::Method::POST,
            "/channels/1/messages".to_string(),
            StatusCode::FORBIDDEN,
            Bytes::from_static(br#"{"code": 50013, "message": "Missing Permissions"}"#),
        );

        let json = err.json.as_ref().unwrap();
        assert_eq!(json["code"], 50013);
        assert_eq!(
            err.to_string(),
            "POST /channels/1/messages failed with 403 Forbidden"
        );
    }

    #[test]
    fn test_status_error_keeps_raw_body() {
        let err = HttpStatusError::new(
            http::Method::GET,
            "/gateway".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
            Bytes::from_static(b"<html>oops</html>"),
        );

        assert!(err.json.is_none());
        assert_eq!(&err.body[..], b"<html>oops</html>");
    }

    #[test]
    fn test_exhausted_retries_report_last_status() {
        let last = HttpStatusError::new(
            http::Method::GET,
            "/gateway".to_string(),
            StatusCode::BAD_GATEWAY,
            Bytes::new(),
        );
        let err = SchedulerError::RetriesExhausted { retries: 3, last };

        assert_eq!(err.status(), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(err.kind(), "retries_exhausted");
        assert_eq!(
            SchedulerError::TransportAbort(AbortReason::Timeout).status(),
            None
        );
    }
}
