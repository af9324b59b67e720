use std::time::Duration;

use http::HeaderMap;

pub const LIMIT: &str = "x-ratelimit-limit";
pub const REMAINING: &str = "x-ratelimit-remaining";
pub const RESET: &str = "x-ratelimit-reset";
pub const GLOBAL: &str = "x-ratelimit-global";
pub const RETRY_AFTER: &str = "retry-after";

/// Unit the remote uses for `Retry-After` values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetryAfterUnit {
    #[default]
    Seconds,
    Milliseconds,
}

impl RetryAfterUnit {
    pub fn to_duration(self, value: f64) -> Option<Duration> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let secs = match self {
            Self::Seconds => value,
            Self::Milliseconds => value / 1000.0,
        };
        Duration::try_from_secs_f64(secs).ok()
    }
}

/// Rate-limit state reported by a single response.
///
/// `limit` and `remaining` are `-1` when the header is missing or
/// unparseable.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: i64,
    pub remaining: i64,
    /// Epoch milliseconds at which `remaining` returns to `limit`.
    pub reset_at: Option<i64>,
    pub retry_after: Option<Duration>,
    pub global: bool,
}

impl Default for RateLimitHeaders {
    fn default() -> Self {
        Self {
            limit: -1,
            remaining: -1,
            reset_at: None,
            retry_after: None,
            global: false,
        }
    }
}

impl RateLimitHeaders {
    /// Read the rate-limit headers. Header names are matched
    /// case-insensitively by `HeaderMap`.
    pub fn parse(headers: &HeaderMap, unit: RetryAfterUnit) -> Self {
        Self {
            limit: int(headers, LIMIT),
            remaining: int(headers, REMAINING),
            reset_at: float(headers, RESET).map(|secs| (secs * 1000.0).round() as i64),
            retry_after: float(headers, RETRY_AFTER).and_then(|v| unit.to_duration(v)),
            global: text(headers, GLOBAL).is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }

    /// Whether the response carried any bucket information at all.
    pub fn is_known(&self) -> bool {
        self.limit >= 0 || self.remaining >= 0
    }
}

fn text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

fn int(headers: &HeaderMap, name: &str) -> i64 {
    text(headers, name)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1)
}

fn float(headers: &HeaderMap, name: &str) -> Option<f64> {
    text(headers, name)?.parse::<f64>().ok().filter(|v| v.is_finite())
}
