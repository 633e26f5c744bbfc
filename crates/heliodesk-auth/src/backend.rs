//! Capabilities the reconciler consumes from the auth backend.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::session::{AuthChange, Session};

/// Whether the backend answered and said no, or could not be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The backend rejected the request (bad code, revoked token, 4xx).
    Rejected,
    /// The request did not complete (connection failure, timeout, 5xx).
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Rejected,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Transport,
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Backend-as-a-service auth client.
///
/// Calls are not cancelled once issued and may resolve in any order.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Currently valid session, if any.
    async fn get_session(&self) -> BackendResult<Option<Session>>;

    /// Exchanges an authorization code (PKCE flow) for a session.
    async fn exchange_code_for_session(&self, code: &str) -> BackendResult<Option<Session>>;

    /// Establishes a session from an access/refresh token pair (implicit flow).
    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> BackendResult<Option<Session>>;

    async fn sign_out(&self) -> BackendResult<()>;

    /// Starts the provider redirect; the provider returns to `redirect_to`.
    async fn start_oauth_redirect(&self, redirect_to: &str) -> BackendResult<()>;

    /// Session-change notifications for the lifetime of the backend.
    fn subscribe(&self) -> broadcast::Receiver<AuthChange>;
}
