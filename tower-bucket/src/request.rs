use bucket_limit::Route;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::Uri;
use http::header::AUTHORIZATION;
use http::header::CONTENT_TYPE;
use http::header::USER_AGENT;
use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;
use percent_encoding::utf8_percent_encode;
use serde::Serialize;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

pub const AUDIT_LOG_REASON: HeaderName = HeaderName::from_static("x-audit-log-reason");

// Same set `encodeURIComponent` leaves alone.
const REASON: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// An already encoded request body.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(Bytes),
    Multipart { boundary: String, body: Bytes },
}

/// What to send to a route: extra headers, an optional body and an
/// optional audit-log reason.
#[derive(Clone, Debug, Default)]
pub struct RequestSpec {
    headers: HeaderMap,
    body: Option<RequestBody>,
    reason: Option<String>,
}

impl RequestSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn with_json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.with_body(RequestBody::Json(body.into())))
    }

    /// Attach a multipart body encoded elsewhere with `boundary`.
    pub fn with_multipart(self, boundary: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.with_body(RequestBody::Multipart {
            boundary: boundary.into(),
            body: body.into(),
        })
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Record `reason` in the audit log of the affected guild.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A request rendered once and replayed for every attempt.
#[derive(Clone, Debug)]
pub(crate) struct PreparedRequest {
    pub(crate) method: http::Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
}

impl PreparedRequest {
    pub(crate) fn build(
        route: &Route,
        spec: RequestSpec,
        config: &SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let path = route.path()?;
        let target = if route.is_absolute() {
            path
        } else {
            let base = config.api_base.to_string();
            format!("{}{}", base.trim_end_matches('/'), path)
        };
        let uri = target
            .parse::<Uri>()
            .map_err(|err| SchedulerError::InvalidRequest(err.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, header_value(&config.user_agent)?);

        if let Some(token) = &config.token
            && uri.authority() == config.api_base.authority()
        {
            let mut value = header_value(token)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        if let Some(reason) = &spec.reason {
            let encoded = utf8_percent_encode(reason, REASON).to_string();
            headers.insert(AUDIT_LOG_REASON, header_value(&encoded)?);
        }

        let body = match spec.body {
            Some(RequestBody::Json(body)) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                body
            }
            Some(RequestBody::Multipart { boundary, body }) => {
                let content_type = format!("multipart/form-data; boundary={boundary}");
                headers.insert(CONTENT_TYPE, header_value(&content_type)?);
                body
            }
            None => Bytes::new(),
        };

        // Caller supplied headers win over the derived ones.
        for (name, value) in spec.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        Ok(Self {
            method: route.method().into(),
            uri,
            headers,
            body,
        })
    }

    pub(crate) fn to_http(&self) -> http::Request<Bytes> {
        let mut request = http::Request::new(self.body.clone());
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

fn header_value(value: &str) -> Result<HeaderValue, SchedulerError> {
    HeaderValue::from_str(value).map_err(|err| SchedulerError::InvalidRequest(err.to_string()))
}
