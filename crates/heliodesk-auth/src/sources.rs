//! Adapters from the shell's listeners to the reconciliation pipeline.
//!
//! Every listener (address bar, startup deep link, runtime deep link,
//! single-instance forward) produces a [`CallbackEvent`]; they all converge on
//! [`AuthSessionReconciler::handle_callback`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::callback::{CallbackEvent, CallbackSource};
use crate::reconciler::{AuthSessionReconciler, Reconciliation};

/// Returns the first argument that starts with one of `schemes`.
pub fn find_deep_link_arg<S, T>(args: &[S], schemes: &[T]) -> Option<String>
where
    S: AsRef<str>,
    T: AsRef<str>,
{
    args.iter()
        .map(|arg| arg.as_ref())
        .find(|arg| schemes.iter().any(|scheme| arg.starts_with(scheme.as_ref())))
        .map(str::to_string)
}

/// Desktop deep-link integration.
#[async_trait]
pub trait DeepLinkHost: Send + Sync {
    /// URLs the process was launched with.
    ///
    /// # Errors
    /// Returns an error when the deep-link integration is not ready yet.
    async fn initial_urls(&self) -> anyhow::Result<Vec<String>>;
}

/// Feeds the launch deep link (if any) through the pipeline.
///
/// An unavailable deep-link integration is logged and ignored.
pub async fn process_startup_deep_links(
    reconciler: &AuthSessionReconciler,
    host: &dyn DeepLinkHost,
) -> Option<Reconciliation> {
    let urls = match host.initial_urls().await {
        Ok(urls) => urls,
        Err(e) => {
            debug!("No initial deep link or deep-link host not available: {e:#}");
            return None;
        }
    };
    let event = CallbackEvent::from_url_list(CallbackSource::StartupDeepLink, &urls)?;
    Some(reconciler.handle_callback(&event).await)
}

/// Checks the browser's current address (page load, hash change).
pub async fn check_browser_location(reconciler: &AuthSessionReconciler) -> Reconciliation {
    let href = reconciler.browser().href();
    reconciler.handle_callback(&CallbackEvent::browser(href)).await
}

/// Handle the shell's listeners push callback URLs into.
#[derive(Debug, Clone)]
pub struct CallbackSender {
    tx: mpsc::UnboundedSender<CallbackEvent>,
    schemes: Vec<String>,
}

impl CallbackSender {
    /// Returns false once the listener has stopped.
    pub fn send(&self, event: CallbackEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Address bar changed (load or hash change).
    pub fn browser_navigated(&self, url: impl Into<String>) -> bool {
        self.send(CallbackEvent::browser(url))
    }

    /// Runtime deep-link delivery; a list of URLs uses its first entry.
    pub fn deep_link_opened<S: AsRef<str>>(&self, urls: &[S]) -> bool {
        CallbackEvent::from_url_list(CallbackSource::RuntimeDeepLink, urls)
            .is_some_and(|event| self.send(event))
    }

    /// Arguments forwarded by the single-instance guard from a second launch.
    pub fn forward_args<S: AsRef<str>>(&self, args: &[S]) -> bool {
        match find_deep_link_arg(args, self.schemes.as_slice()) {
            Some(url) => {
                info!("Forwarding deep link from second instance");
                self.send(CallbackEvent::app_focus(url))
            }
            None => false,
        }
    }

    /// Deep link found in this process's own launch arguments.
    pub fn startup_args<S: AsRef<str>>(&self, args: &[S]) -> bool {
        find_deep_link_arg(args, self.schemes.as_slice())
            .is_some_and(|url| self.send(CallbackEvent::startup_deep_link(url)))
    }
}

/// Starts the task that drives every pushed event through the pipeline.
///
/// Each event is handled on its own task so that independent listeners race
/// exactly as they would in the shell; the reconciler's guards decide which
/// one wins. The task ends when every sender has been dropped.
pub fn spawn_callback_listener(
    reconciler: Arc<AuthSessionReconciler>,
    schemes: Vec<String>,
) -> (CallbackSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallbackEvent>();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move {
                let outcome = reconciler.handle_callback(&event).await;
                debug!("Callback from {} finished: {outcome:?}", event.source);
            });
        }
        debug!("Callback listener stopped");
    });
    (CallbackSender { tx, schemes }, handle)
}
