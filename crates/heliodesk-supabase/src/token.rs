//! GoTrue wire types and JWT claim decoding.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, TimeZone, Utc};
use heliodesk_auth::{Session, User};
use serde::Deserialize;

/// User object returned by `/auth/v1/user` and embedded in token responses.
#[derive(Debug, Clone, Deserialize)]
pub struct GoTrueUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl From<GoTrueUser> for User {
    fn from(user: GoTrueUser) -> Self {
        Self {
            id: user.id,
            email: user.email.filter(|e| !e.is_empty()),
        }
    }
}

/// Body of a successful `/auth/v1/token` call.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: Option<GoTrueUser>,
}

impl TokenResponse {
    /// Builds a session, or `None` when the response carried no user.
    pub fn into_session(self) -> Option<Session> {
        let expires_at = self
            .expires_at
            .and_then(from_unix)
            .or_else(|| self.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)))
            .or_else(|| jwt_expiry(&self.access_token))
            .unwrap_or_else(Utc::now);
        let user = self.user?;
        Some(Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: user.into(),
        })
    }
}

/// Error body shapes GoTrue uses across versions.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error_description: Option<String>,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    /// Most descriptive message in the body, falling back to the raw text.
    pub fn describe(raw: &str) -> String {
        let parsed: Self = serde_json::from_str(raw).unwrap_or_default();
        parsed
            .error_description
            .or(parsed.msg)
            .or(parsed.message)
            .or(parsed.error)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| raw.trim().to_string())
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Reads the `exp` claim of a JWT without verifying its signature.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let decoded = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')).ok()?;
    let json: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    json.get("exp")?.as_i64().and_then(from_unix)
}
