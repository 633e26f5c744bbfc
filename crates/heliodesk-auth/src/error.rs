//! Terminal failures of the reconciliation pipeline.

use std::fmt;

use crate::backend::{BackendError, BackendErrorKind};

/// Categories of reconciliation failures.
///
/// All kinds are handled the same way at the boundary: the signing-in flag
/// is cleared, the user is notified, and an existing session is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileErrorKind {
    /// Callback URL could not be parsed. Extraction degrades this to
    /// "no auth parameters", so it never terminates a pipeline.
    ParseFailure,
    /// The provider redirected back with an `error` parameter.
    AuthorizationDenied,
    /// The backend rejected the authorization code or token pair.
    ExchangeFailure,
    /// The payload carried none of the usable credential shapes.
    NoCredentials,
    /// The network call itself failed.
    TransportFailure,
}

impl fmt::Display for ReconcileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileErrorKind::ParseFailure => write!(f, "parse_failure"),
            ReconcileErrorKind::AuthorizationDenied => write!(f, "authorization_denied"),
            ReconcileErrorKind::ExchangeFailure => write!(f, "exchange_failure"),
            ReconcileErrorKind::NoCredentials => write!(f, "no_credentials"),
            ReconcileErrorKind::TransportFailure => write!(f, "transport_failure"),
        }
    }
}

/// Structured reconciliation error with kind and display message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileError {
    pub kind: ReconcileErrorKind,
    pub message: String,
}

impl ReconcileError {
    pub fn new(kind: ReconcileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Provider returned `error=...` (with an optional description).
    pub fn denied(error: &str, description: Option<&str>) -> Self {
        let message = match description {
            Some(desc) if !desc.is_empty() => format!("{error}: {desc}"),
            _ => error.to_string(),
        };
        Self::new(ReconcileErrorKind::AuthorizationDenied, message)
    }

    pub fn no_credentials() -> Self {
        Self::new(
            ReconcileErrorKind::NoCredentials,
            "No tokens or authorization code received.",
        )
    }

    /// Backend call succeeded but produced no session.
    pub fn empty_result(operation: &str) -> Self {
        Self::new(
            ReconcileErrorKind::ExchangeFailure,
            format!("No user data returned from {operation}"),
        )
    }

    /// Text shown to the user when an attempt fails.
    pub fn user_notice(&self) -> String {
        if self.message.is_empty() {
            "Authentication failed: Please try again.".to_string()
        } else {
            format!("Authentication failed: {}", self.message)
        }
    }
}

impl From<BackendError> for ReconcileError {
    fn from(err: BackendError) -> Self {
        let kind = match err.kind {
            BackendErrorKind::Rejected => ReconcileErrorKind::ExchangeFailure,
            BackendErrorKind::Transport => ReconcileErrorKind::TransportFailure,
        };
        Self::new(kind, err.message)
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ReconcileError {}
