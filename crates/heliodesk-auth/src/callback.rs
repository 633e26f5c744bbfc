//! Callback events and auth payload extraction.
//!
//! Extraction is pure: it never touches session state and never fails. A URL
//! that cannot be parsed is scanned with a regex fallback, and a URL without
//! auth parameters yields `None` so callers skip the pipeline entirely.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;
use url::Url;

/// Where a callback URL was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackSource {
    /// The browser's own address bar (at load and on hash change).
    Browser,
    /// Deep link present when the desktop process started.
    StartupDeepLink,
    /// Deep link delivered while the desktop process is running.
    RuntimeDeepLink,
    /// Deep link forwarded by the single-instance guard from a second launch.
    AppFocusEvent,
}

impl CallbackSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackSource::Browser => "browser",
            CallbackSource::StartupDeepLink => "startup-deep-link",
            CallbackSource::RuntimeDeepLink => "runtime-deep-link",
            CallbackSource::AppFocusEvent => "app-focus-event",
        }
    }

    /// Only the address bar has visible URL state to clean up.
    pub fn is_browser(&self) -> bool {
        matches!(self, CallbackSource::Browser)
    }
}

impl fmt::Display for CallbackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw URL observed by one of the listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackEvent {
    pub source: CallbackSource,
    pub raw_url: String,
}

impl CallbackEvent {
    pub fn new(source: CallbackSource, raw_url: impl Into<String>) -> Self {
        Self {
            source,
            raw_url: raw_url.into(),
        }
    }

    pub fn browser(raw_url: impl Into<String>) -> Self {
        Self::new(CallbackSource::Browser, raw_url)
    }

    pub fn startup_deep_link(raw_url: impl Into<String>) -> Self {
        Self::new(CallbackSource::StartupDeepLink, raw_url)
    }

    pub fn runtime_deep_link(raw_url: impl Into<String>) -> Self {
        Self::new(CallbackSource::RuntimeDeepLink, raw_url)
    }

    pub fn app_focus(raw_url: impl Into<String>) -> Self {
        Self::new(CallbackSource::AppFocusEvent, raw_url)
    }

    /// Deep-link channels may deliver a list of URLs; only the first is used.
    pub fn from_url_list<S: AsRef<str>>(source: CallbackSource, urls: &[S]) -> Option<Self> {
        urls.first().map(|url| Self::new(source, url.as_ref()))
    }

    pub fn payload(&self) -> Option<AuthCallbackPayload> {
        extract_payload(&self.raw_url)
    }
}

/// Auth parameters carried by a callback URL. At most one shape is populated.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthCallbackPayload {
    /// The provider refused the authorization.
    Error {
        error: String,
        description: Option<String>,
    },
    /// PKCE flow: an authorization code to exchange.
    Code { code: String },
    /// Implicit flow: raw tokens in the fragment.
    TokenPair {
        access_token: String,
        refresh_token: String,
    },
    /// Auth parameters were present but none of the shapes above is complete
    /// (an access token without its refresh token).
    Unusable,
}

impl fmt::Debug for AuthCallbackPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthCallbackPayload::Error { error, description } => f
                .debug_struct("Error")
                .field("error", error)
                .field("description", description)
                .finish(),
            AuthCallbackPayload::Code { .. } => f.write_str("Code { .. }"),
            AuthCallbackPayload::TokenPair { .. } => f.write_str("TokenPair { .. }"),
            AuthCallbackPayload::Unusable => f.write_str("Unusable"),
        }
    }
}

fn fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#(.+)").expect("fragment pattern is valid"))
}

fn query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\?(.+?)(?:#|$)").expect("query pattern is valid"))
}

/// Splits a URL-like string into (fragment, query) without the leading `#`/`?`.
fn split_segments(raw: &str) -> (Option<String>, Option<String>) {
    match Url::parse(raw) {
        Ok(url) => (
            url.fragment().map(str::to_string),
            url.query().map(str::to_string),
        ),
        Err(err) => {
            debug!("Callback URL did not parse ({err}), scanning segments");
            let fragment = fragment_re()
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            let query = query_re()
                .captures(raw)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            (fragment, query)
        }
    }
}

fn parse_params(segment: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(segment) = segment {
        for (key, value) in url::form_urlencoded::parse(segment.as_bytes()) {
            // First occurrence wins, like URLSearchParams::get.
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

/// Extracts the auth payload from a callback URL.
///
/// Fragment parameters take precedence over query parameters with the same
/// name. Empty values count as absent. Priority: `error` > `code` >
/// `access_token` + `refresh_token`.
pub fn extract_payload(raw_url: &str) -> Option<AuthCallbackPayload> {
    let (fragment, query) = split_segments(raw_url.trim());
    let fragment_params = parse_params(fragment.as_deref());
    let query_params = parse_params(query.as_deref());

    let get = |key: &str| {
        fragment_params
            .get(key)
            .filter(|v| !v.is_empty())
            .or_else(|| query_params.get(key).filter(|v| !v.is_empty()))
            .cloned()
    };

    if let Some(error) = get("error") {
        return Some(AuthCallbackPayload::Error {
            error,
            description: get("error_description"),
        });
    }

    if let Some(code) = get("code") {
        return Some(AuthCallbackPayload::Code { code });
    }

    match (get("access_token"), get("refresh_token")) {
        (Some(access_token), Some(refresh_token)) => Some(AuthCallbackPayload::TokenPair {
            access_token,
            refresh_token,
        }),
        (Some(_), None) => Some(AuthCallbackPayload::Unusable),
        _ => None,
    }
}

/// Returns the URL without its query and fragment.
pub fn strip_auth_params(raw_url: &str) -> String {
    match Url::parse(raw_url) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}
