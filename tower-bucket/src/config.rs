use std::time::Duration;

use bucket_limit::RetryAfterUnit;
use http::StatusCode;
use http::Uri;

const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
const DEFAULT_USER_AGENT: &str = concat!(
    "DiscordBot (",
    env!("CARGO_PKG_REPOSITORY"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Settings for a [`Scheduler`](crate::Scheduler).
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub(crate) timeout: Duration,
    pub(crate) max_retries: u32,
    pub(crate) retry_base_delay: Duration,
    pub(crate) bucket_idle_ttl: Duration,
    pub(crate) transient_statuses: Vec<StatusCode>,
    pub(crate) retry_after_unit: RetryAfterUnit,
    pub(crate) api_base: Uri,
    pub(crate) token: Option<String>,
    pub(crate) user_agent: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 1,
            retry_base_delay: Duration::from_secs(1),
            bucket_idle_ttl: Duration::from_secs(60),
            transient_statuses: vec![StatusCode::BAD_GATEWAY],
            retry_after_unit: RetryAfterUnit::Seconds,
            api_base: Uri::from_static(DEFAULT_API_BASE),
            token: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort a send that has not completed after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retry a transient status at most `max_retries` times.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Backoff unit: retry `n` waits `n * delay`. Also the lock applied to a
    /// 429 that does not say how long to wait.
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Drop a bucket after it has been empty and unused for `ttl`.
    pub fn with_bucket_idle_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_idle_ttl = ttl;
        self
    }

    /// Statuses treated as transient and retried with backoff.
    pub fn with_transient_statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.transient_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_retry_after_unit(mut self, unit: RetryAfterUnit) -> Self {
        self.retry_after_unit = unit;
        self
    }

    /// Base URI that relative route templates are joined onto. Only requests
    /// to this authority carry the `Authorization` header.
    pub fn with_api_base(mut self, api_base: Uri) -> Self {
        self.api_base = api_base;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }

    pub fn bucket_idle_ttl(&self) -> Duration {
        self.bucket_idle_ttl
    }

    pub(crate) fn is_transient(&self, status: StatusCode) -> bool {
        self.transient_statuses.contains(&status)
    }
}
