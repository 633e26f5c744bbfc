//! Reconciles OAuth callbacks from every source into one session.
//!
//! Each callback runs through a fixed sequence of guarded steps:
//!
//! 1. extraction (no auth parameters: skip, touch nothing)
//! 2. debounce (an attempt was accepted or finished within the window: skip)
//! 3. in-flight guard (another pipeline is running: skip)
//! 4. existing-session short-circuit
//! 5. error payload, code exchange, or token pair, in that priority
//!
//! Overlapping callbacks are dropped, never queued. Any genuine pending
//! authorization is still present in its source and can be re-delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, BackendError};
use crate::callback::{AuthCallbackPayload, CallbackEvent, strip_auth_params};
use crate::config::AuthConfig;
use crate::error::ReconcileError;
use crate::session::{AuthChange, Session};
use crate::shell::{BrowserLocation, LogNotifier, NoBrowser, Notifier};
use crate::storage::{AuthStorage, lock};

/// Why a callback did not run the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The URL carried no `error`, `code` or `access_token`.
    NoAuthParams,
    /// Another attempt was accepted or finished within the debounce window.
    Debounced,
    /// A pipeline is already running.
    InFlight,
}

/// Result of feeding one callback event to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Skipped(SkipReason),
    Adopted(Session),
    Failed(ReconcileError),
}

impl Reconciliation {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Reconciliation::Skipped(_))
    }
}

/// Result of a sign-in click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// A sign-in is already outstanding; nothing was requested.
    AlreadyInProgress,
    /// The backend already had a valid session; it was adopted.
    AlreadyAuthenticated(Session),
    /// The provider redirect was requested; a callback will follow.
    RedirectRequested,
}

/// Holds an atomic flag for the lifetime of the guard.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns the session lifecycle and the flags around it.
pub struct AuthSessionReconciler {
    backend: Arc<dyn AuthBackend>,
    storage: AuthStorage,
    browser: Arc<dyn BrowserLocation>,
    notifier: Arc<dyn Notifier>,
    redirect_url: String,
    debounce: Duration,
    in_flight: AtomicBool,
    initiating: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    /// Bumped on every session change; guarded together with `session_tx`.
    adoption: Mutex<u64>,
    session_tx: watch::Sender<Option<Session>>,
}

impl AuthSessionReconciler {
    pub fn new(backend: Arc<dyn AuthBackend>, storage: AuthStorage) -> Self {
        let (session_tx, _) = watch::channel(None);
        Self {
            backend,
            storage,
            browser: Arc::new(NoBrowser),
            notifier: Arc::new(LogNotifier),
            redirect_url: AuthConfig::DEFAULT_REDIRECT_URL.to_string(),
            debounce: Duration::from_millis(AuthConfig::DEFAULT_DEBOUNCE_MS),
            in_flight: AtomicBool::new(false),
            initiating: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            adoption: Mutex::new(0),
            session_tx,
        }
    }

    /// Applies the redirect URL and debounce window from `config`.
    #[must_use]
    pub fn with_config(mut self, config: &AuthConfig) -> Self {
        self.redirect_url.clone_from(&config.redirect_url);
        self.debounce = config.debounce();
        self
    }

    #[must_use]
    pub fn with_browser(mut self, browser: Arc<dyn BrowserLocation>) -> Self {
        self.browser = browser;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn current_session(&self) -> Option<Session> {
        self.session_tx.borrow().clone()
    }

    /// Watches the current session (widgets, settings, navigation).
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session_tx.subscribe()
    }

    pub fn is_signing_in(&self) -> bool {
        self.storage.is_signing_in()
    }

    pub fn remember_me(&self) -> bool {
        self.storage.remember_me()
    }

    /// Records the remember-me toggle.
    ///
    /// # Errors
    /// Returns an error if the flag cannot be persisted.
    pub fn set_remember_me(&self, remember: bool) -> anyhow::Result<()> {
        self.storage.set_remember_me(remember)
    }

    pub fn storage(&self) -> &AuthStorage {
        &self.storage
    }

    pub fn browser(&self) -> &Arc<dyn BrowserLocation> {
        &self.browser
    }

    /// Replaces the current session. A present session always ends an
    /// outstanding sign-in.
    fn set_current(&self, session: Option<Session>) {
        let signed_in = session.is_some();
        {
            let mut generation = lock(&self.adoption);
            *generation += 1;
            self.session_tx.send_replace(session);
        }
        if signed_in {
            self.storage.clear_signing_in();
        }
    }

    fn generation(&self) -> u64 {
        *lock(&self.adoption)
    }

    /// Adopts `session` unless another path changed the session since
    /// `expected` was read; in that case the newer session stays.
    fn adopt_if_current(&self, expected: u64, session: Session) -> Session {
        let mut generation = lock(&self.adoption);
        if *generation != expected {
            let current = self.session_tx.borrow().clone();
            if let Some(current) = current {
                info!(
                    "Session changed while the callback was in flight; keeping {}",
                    current.display_user()
                );
                return current;
            }
        }
        *generation += 1;
        self.session_tx.send_replace(Some(session.clone()));
        session
    }

    /// Debounce check. Stamps the clock when the attempt is accepted.
    fn accept_attempt(&self) -> bool {
        let now = Instant::now();
        let mut last = lock(&self.last_attempt);
        if let Some(previous) = *last
            && now.duration_since(previous) < self.debounce
        {
            return false;
        }
        *last = Some(now);
        true
    }

    fn mark_attempt_finished(&self) {
        *lock(&self.last_attempt) = Some(Instant::now());
    }

    /// Runs one callback event through the pipeline.
    pub async fn handle_callback(&self, event: &CallbackEvent) -> Reconciliation {
        let Some(payload) = event.payload() else {
            debug!("No auth parameters in {} callback, ignoring", event.source);
            return Reconciliation::Skipped(SkipReason::NoAuthParams);
        };

        if !self.accept_attempt() {
            debug!("Dropping duplicate {} callback inside debounce window", event.source);
            return Reconciliation::Skipped(SkipReason::Debounced);
        }

        let Some(_in_flight) = FlagGuard::acquire(&self.in_flight) else {
            debug!("Dropping {} callback: reconciliation already in flight", event.source);
            return Reconciliation::Skipped(SkipReason::InFlight);
        };

        info!("Processing auth callback ({})", event.source);
        let result = self.reconcile(&payload).await;
        self.mark_attempt_finished();

        match result {
            Ok(session) => {
                info!("Signed in as {} via {}", session.display_user(), event.source);
                self.storage.clear_signing_in();
                if event.source.is_browser() {
                    self.browser.replace_url(&strip_auth_params(&event.raw_url));
                }
                Reconciliation::Adopted(session)
            }
            Err(err) => {
                error!("Auth callback ({}) failed [{}]: {err}", event.source, err.kind);
                self.storage.clear_signing_in();
                self.notifier.notify(&err.user_notice());
                Reconciliation::Failed(err)
            }
        }
    }

    async fn reconcile(&self, payload: &AuthCallbackPayload) -> Result<Session, ReconcileError> {
        match self.backend.get_session().await {
            Ok(Some(existing)) => {
                info!("Existing session found for {}", existing.display_user());
                self.set_current(Some(existing.clone()));
                return Ok(existing);
            }
            Ok(None) => {}
            Err(e) => warn!("Existing-session check failed, continuing: {e}"),
        }

        let expected = self.generation();
        let session = match payload {
            AuthCallbackPayload::Error { error, description } => {
                return Err(ReconcileError::denied(error, description.as_deref()));
            }
            AuthCallbackPayload::Code { code } => self
                .backend
                .exchange_code_for_session(code)
                .await?
                .ok_or_else(|| ReconcileError::empty_result("code exchange"))?,
            AuthCallbackPayload::TokenPair {
                access_token,
                refresh_token,
            } => self
                .backend
                .set_session(access_token, refresh_token)
                .await?
                .ok_or_else(|| ReconcileError::empty_result("token submission"))?,
            AuthCallbackPayload::Unusable => return Err(ReconcileError::no_credentials()),
        };

        Ok(self.adopt_if_current(expected, session))
    }

    /// Starts a sign-in. Duplicate clicks while one is outstanding are no-ops.
    ///
    /// # Errors
    /// Returns the backend error if the redirect could not be requested; the
    /// signing-in flag is already cleared and the user notified.
    pub async fn sign_in(&self, remember_me: bool) -> Result<SignInOutcome, BackendError> {
        if self.storage.is_signing_in() {
            info!("Sign-in already in progress, ignoring duplicate request");
            return Ok(SignInOutcome::AlreadyInProgress);
        }
        let Some(_initiating) = FlagGuard::acquire(&self.initiating) else {
            info!("Sign-in already in progress, ignoring duplicate request");
            return Ok(SignInOutcome::AlreadyInProgress);
        };

        match self.backend.get_session().await {
            Ok(Some(existing)) => {
                info!("Already authenticated as {}", existing.display_user());
                self.set_current(Some(existing.clone()));
                self.storage.clear_signing_in();
                return Ok(SignInOutcome::AlreadyAuthenticated(existing));
            }
            Ok(None) => {}
            Err(e) => warn!("Session check before sign-in failed, continuing: {e}"),
        }

        if let Err(e) = self.storage.set_remember_me(remember_me) {
            warn!("Failed to persist remember-me preference: {e:#}");
        }
        if let Err(e) = self.storage.set_signing_in() {
            warn!("Failed to persist signing-in flag: {e:#}");
        }

        info!("Requesting OAuth redirect back to {}", self.redirect_url);
        if let Err(e) = self.backend.start_oauth_redirect(&self.redirect_url).await {
            error!("Error signing in: {e}");
            self.storage.clear_signing_in();
            self.notifier.notify(&format!("Failed to sign in: {e}"));
            return Err(e);
        }

        Ok(SignInOutcome::RedirectRequested)
    }

    /// Signs out through the backend. The local session is cleared by the
    /// backend's `SignedOut` notification, not here.
    ///
    /// # Errors
    /// Returns the backend error; the user has been notified.
    pub async fn sign_out(&self) -> Result<(), BackendError> {
        if let Err(e) = self.backend.sign_out().await {
            error!("Error signing out: {e}");
            self.notifier.notify(&format!("Failed to sign out: {e}"));
            return Err(e);
        }
        info!("Signed out");
        Ok(())
    }

    /// Startup check: adopt the backend's session, or clear a stale
    /// signing-in flag left behind by a restart mid sign-in.
    pub async fn restore(&self) -> Option<Session> {
        match self.backend.get_session().await {
            Ok(Some(session)) => {
                info!("Restored session for {}", session.display_user());
                self.set_current(Some(session.clone()));
                self.storage.clear_signing_in();
                Some(session)
            }
            Ok(None) => {
                if self.storage.is_signing_in() {
                    info!("No session found but signing-in flag is set, clearing it");
                    self.storage.clear_signing_in();
                }
                None
            }
            Err(e) => {
                warn!("Failed to check for an existing session: {e}");
                self.storage.clear_signing_in();
                None
            }
        }
    }

    /// Applies one backend session-change notification.
    pub fn apply_auth_change(&self, change: AuthChange) {
        info!(
            "Auth state changed: {} ({})",
            change.event,
            change
                .session
                .as_ref()
                .map_or("no user", Session::display_user)
        );
        self.set_current(change.session);
    }

    /// Follows the backend's session-change notifications until the backend
    /// drops its sender.
    pub fn spawn_session_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.backend.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => this.apply_auth_change(change),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {skipped} auth notifications, re-reading session");
                        match this.backend.get_session().await {
                            Ok(session) => this.set_current(session),
                            Err(e) => warn!("Failed to re-read session: {e}"),
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Auth notification channel closed");
                        break;
                    }
                }
            }
        })
    }
}
