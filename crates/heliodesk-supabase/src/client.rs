//! `AuthBackend` over the Supabase GoTrue REST API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use heliodesk_auth::backend::BackendResult;
use heliodesk_auth::{
    AuthBackend, AuthChange, AuthChangeEvent, AuthConfig, AuthStorage, BackendError,
    BackendErrorKind, Session,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::opener::{SystemBrowser, UrlOpener};
use crate::pkce::generate_pkce;
use crate::token::{ErrorBody, GoTrueUser, TokenResponse, jwt_expiry};

/// Stored sessions this close to expiry are refreshed before being returned.
const REFRESH_MARGIN_SECS: i64 = 10;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 32;

/// Supabase auth client persisting its session through [`AuthStorage`].
pub struct SupabaseBackend {
    client: Client,
    base_url: String,
    anon_key: String,
    provider: String,
    storage: AuthStorage,
    storage_key: String,
    opener: Arc<dyn UrlOpener>,
    events: broadcast::Sender<AuthChange>,
}

impl SupabaseBackend {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        anon_key: &str,
        provider: &str,
        storage: AuthStorage,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("HelioDesk/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let storage_key = format!("sb-{}-auth-token", project_ref(&base_url));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            client,
            base_url,
            anon_key: anon_key.to_string(),
            provider: provider.to_string(),
            storage,
            storage_key,
            opener: Arc::new(SystemBrowser),
            events,
        })
    }

    /// Builds a backend from loaded configuration.
    ///
    /// # Errors
    /// Returns an error if the backend URL or key is missing.
    pub fn from_config(config: &AuthConfig, storage: AuthStorage) -> Result<Self> {
        let (url, key) = config.require_backend()?;
        Self::new(url, key, &config.oauth_provider, storage)
    }

    #[must_use]
    pub fn with_opener(mut self, opener: Arc<dyn UrlOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// Storage key holding the serialized session.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Storage key holding the PKCE verifier between redirect and exchange.
    pub fn verifier_key(&self) -> String {
        format!("{}-code-verifier", self.storage_key)
    }

    /// Authorize URL the user is sent to.
    pub fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> String {
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("provider", &self.provider)
            .append_pair("redirect_to", redirect_to)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "s256")
            .finish();
        format!("{}/auth/v1/authorize?{query}", self.base_url)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    fn emit(&self, event: AuthChangeEvent, session: Option<Session>) {
        // No subscribers is fine.
        let _ = self.events.send(AuthChange::new(event, session));
    }

    fn load_session(&self) -> Option<Session> {
        let raw = self.storage.get_item(&self.storage_key)?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Discarding unreadable stored session: {e}");
                self.forget_session();
                None
            }
        }
    }

    fn save_session(&self, session: &Session) -> BackendResult<()> {
        let raw = serde_json::to_string(session)
            .map_err(|e| BackendError::transport(format!("Failed to serialize session: {e}")))?;
        self.storage
            .set_item(&self.storage_key, &raw)
            .map_err(|e| BackendError::transport(format!("Failed to store session: {e:#}")))
    }

    fn forget_session(&self) {
        if let Err(e) = self.storage.remove_item(&self.storage_key) {
            warn!("Failed to remove stored session: {e:#}");
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> BackendResult<T> {
        let response = request
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(|e| BackendError::transport(e.to_string()))?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::rejected(format!("Failed to parse response: {e}")))
    }

    async fn token_grant(
        &self,
        grant_type: &str,
        body: serde_json::Value,
    ) -> BackendResult<TokenResponse> {
        let url = format!("{}?grant_type={grant_type}", self.endpoint("token"));
        self.send(self.client.post(url).json(&body)).await
    }

    async fn refresh(&self, refresh_token: &str) -> BackendResult<Session> {
        debug!("Refreshing session");
        let response = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        response
            .into_session()
            .ok_or_else(|| BackendError::rejected("Refresh returned no user"))
    }

    /// Saves `session` and announces it.
    fn adopt(&self, session: Session, event: AuthChangeEvent) -> BackendResult<Session> {
        self.save_session(&session)?;
        info!("Session {event} for {}", session.display_user());
        self.emit(event, Some(session.clone()));
        Ok(session)
    }
}

#[async_trait]
impl AuthBackend for SupabaseBackend {
    async fn get_session(&self) -> BackendResult<Option<Session>> {
        let Some(session) = self.load_session() else {
            return Ok(None);
        };
        if !session.expires_within(TimeDelta::seconds(REFRESH_MARGIN_SECS)) {
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(refreshed) => self
                .adopt(refreshed, AuthChangeEvent::TokenRefreshed)
                .map(Some),
            Err(e) if e.kind == BackendErrorKind::Rejected => {
                warn!("Stored session could not be refreshed: {e}");
                self.forget_session();
                self.emit(AuthChangeEvent::SignedOut, None);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn exchange_code_for_session(&self, code: &str) -> BackendResult<Option<Session>> {
        let verifier_key = self.verifier_key();
        let Some(verifier) = self.storage.get_item(&verifier_key) else {
            return Err(BackendError::rejected(
                "PKCE code verifier not found in storage. Start the sign-in again.",
            ));
        };

        let result = self
            .token_grant(
                "pkce",
                json!({ "auth_code": code, "code_verifier": verifier }),
            )
            .await;
        // A verifier is single use once the server has answered.
        let answered = match &result {
            Ok(_) => true,
            Err(e) => e.kind == BackendErrorKind::Rejected,
        };
        if answered && let Err(e) = self.storage.remove_item(&verifier_key) {
            warn!("Failed to remove PKCE verifier: {e:#}");
        }

        match result?.into_session() {
            Some(session) => self.adopt(session, AuthChangeEvent::SignedIn).map(Some),
            None => Ok(None),
        }
    }

    async fn set_session(
        &self,
        access_token: &str,
        refresh_token: &str,
    ) -> BackendResult<Option<Session>> {
        let Some(expires_at) = jwt_expiry(access_token) else {
            return Err(BackendError::rejected("Access token is not a valid JWT"));
        };

        let session = if expires_at <= Utc::now() {
            self.refresh(refresh_token).await?
        } else {
            let user: GoTrueUser = self
                .send(self.client.get(self.endpoint("user")).bearer_auth(access_token))
                .await?;
            Session {
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                token_type: "bearer".to_string(),
                expires_at,
                user: user.into(),
            }
        };
        self.adopt(session, AuthChangeEvent::SignedIn).map(Some)
    }

    async fn sign_out(&self) -> BackendResult<()> {
        if let Some(session) = self.load_session() {
            let response = self
                .client
                .post(self.endpoint("logout"))
                .header("apikey", &self.anon_key)
                .bearer_auth(&session.access_token)
                .send()
                .await
                .map_err(|e| BackendError::transport(e.to_string()))?;
            match response.status() {
                StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => {
                    debug!("Session already invalid on the server");
                }
                _ => {
                    check_status(response).await?;
                }
            }
        }

        self.forget_session();
        if let Err(e) = self.storage.remove_item(&self.verifier_key()) {
            warn!("Failed to remove PKCE verifier: {e:#}");
        }
        info!("Signed out");
        self.emit(AuthChangeEvent::SignedOut, None);
        Ok(())
    }

    async fn start_oauth_redirect(&self, redirect_to: &str) -> BackendResult<()> {
        let pkce = generate_pkce();
        self.storage
            .set_item(&self.verifier_key(), &pkce.verifier)
            .map_err(|e| BackendError::transport(format!("Failed to store PKCE verifier: {e:#}")))?;

        let url = self.authorize_url(redirect_to, &pkce.challenge);
        info!("Opening {} sign-in page", self.provider);
        self.opener
            .open(&url)
            .map_err(|e| BackendError::transport(format!("{e:#}")))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthChange> {
        self.events.subscribe()
    }
}

/// Maps non-2xx responses: 4xx means the server said no, 5xx means try later.
async fn check_status(response: Response) -> BackendResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = ErrorBody::describe(&body);
    let message = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    };
    warn!("Auth request failed (HTTP {status}): {message}");
    if status.is_client_error() {
        Err(BackendError::rejected(message))
    } else {
        Err(BackendError::transport(message))
    }
}

/// First label of the backend host (`https://abc.supabase.co` -> `abc`).
fn project_ref(base_url: &str) -> String {
    url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .and_then(|host| host.split('.').next().map(str::to_string))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| "local".to_string())
}
