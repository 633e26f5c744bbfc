//! Session state and OAuth callback reconciliation for HelioDesk.
//!
//! The dashboard shell feeds every redirect it observes (address bar, startup
//! deep link, runtime deep link, forwarded deep link) into one
//! [`AuthSessionReconciler`], which turns them into a single session.

pub mod backend;
pub mod callback;
pub mod config;
pub mod error;
pub mod logging;
pub mod reconciler;
pub mod session;
pub mod shell;
pub mod sources;
pub mod storage;

pub use backend::{AuthBackend, BackendError, BackendErrorKind};
pub use callback::{AuthCallbackPayload, CallbackEvent, CallbackSource};
pub use config::AuthConfig;
pub use error::{ReconcileError, ReconcileErrorKind};
pub use reconciler::{AuthSessionReconciler, Reconciliation, SignInOutcome, SkipReason};
pub use session::{AuthChange, AuthChangeEvent, Session, User};
pub use storage::AuthStorage;
