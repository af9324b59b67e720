use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::AsciiSet;
use percent_encoding::NON_ALPHANUMERIC;
use percent_encoding::utf8_percent_encode;

/// Template of the single-message endpoint. Deleting a message is limited
/// separately from everything else that shares this path.
pub const CHANNEL_MESSAGE: &str = "/channels/{channel_id}/messages/{message_id}";

/// Template of the "add own reaction" endpoint.
pub const OWN_REACTION: &str = "/channels/{channel_id}/messages/{message_id}/reactions/{emoji}/@me";

/// Route parameters that partition buckets.
pub const GUILD_ID: &str = "guild_id";
pub const CHANNEL_ID: &str = "channel_id";
pub const WEBHOOK_ID: &str = "webhook_id";

const KEY_SEPARATOR: char = ':';

// Unreserved characters are left as-is when substituting path parameters.
const PATH_PARAM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// The verbs the REST API accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
        }
    }
}

/// Errors produced while rendering a route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    /// The template names a placeholder that was never given a value.
    #[error("route parameter `{name}` has no value")]
    MissingParam { name: String },

    /// A `{` in the template is never closed.
    #[error("unterminated placeholder in route template `{template}`")]
    Unterminated { template: String },
}

/// Canonical identity of a rate-limit bucket.
///
/// Routes whose keys are equal share one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey(String);

impl BucketKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BucketKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// A logical endpoint invocation: verb, path template and the values of
/// its placeholders.
///
/// ```rust
/// use bucket_limit::Method;
/// use bucket_limit::Route;
/// use bucket_limit::route::CHANNEL_MESSAGE;
///
/// let route = Route::new(Method::Get, CHANNEL_MESSAGE)
///     .param("channel_id", "41771983423143937")
///     .param("message_id", "1");
///
/// assert_eq!(route.bucket_key().as_str(), ":41771983423143937::/channels/{channel_id}/messages/{message_id}");
/// assert_eq!(route.path().unwrap(), "/channels/41771983423143937/messages/1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    template: Cow<'static, str>,
    params: BTreeMap<Cow<'static, str>, String>,
}

impl Route {
    pub fn new(method: Method, template: impl Into<Cow<'static, str>>) -> Self {
        Self {
            method,
            template: template.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a value to the placeholder `{name}`.
    pub fn param(mut self, name: impl Into<Cow<'static, str>>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Whether the template is an absolute URL rather than a path below the
    /// API base.
    pub fn is_absolute(&self) -> bool {
        self.template.starts_with("https://") || self.template.starts_with("http://")
    }

    /// Whether this is the reaction endpoint whose reset header is rounded up
    /// to a whole second by the server.
    pub fn is_own_reaction(&self) -> bool {
        self.template == OWN_REACTION
    }

    /// Derive the bucket this route is throttled under.
    ///
    /// The key is `guild:channel:webhook:template`, with absent ids left
    /// empty. `DELETE` on the single-message template is prefixed with the
    /// verb; no other route takes the method into account.
    pub fn bucket_key(&self) -> BucketKey {
        let part = |name| self.get(name).unwrap_or_default();
        let mut key = String::with_capacity(self.template.len() + 64);
        if self.method == Method::Delete && self.template == CHANNEL_MESSAGE {
            key.push_str(self.method.as_str());
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part(GUILD_ID));
        key.push(KEY_SEPARATOR);
        key.push_str(part(CHANNEL_ID));
        key.push(KEY_SEPARATOR);
        key.push_str(part(WEBHOOK_ID));
        key.push(KEY_SEPARATOR);
        key.push_str(&self.template);
        BucketKey(key)
    }

    /// Render the template with every placeholder substituted.
    pub fn path(&self) -> Result<String, RouteError> {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest: &str = &self.template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| RouteError::Unterminated {
                template: self.template.to_string(),
            })?;
            let name = &after[..close];
            let value = self.get(name).ok_or_else(|| RouteError::MissingParam {
                name: name.to_string(),
            })?;
            out.extend(utf8_percent_encode(value, PATH_PARAM));
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}
