//! Hooks into the application shell: visible address and user notices.

use tracing::{debug, error};

/// The browser's visible address, when running inside a browser view.
pub trait BrowserLocation: Send + Sync {
    fn href(&self) -> String;

    /// Rewrites the visible URL without navigating (history replace).
    fn replace_url(&self, url: &str);
}

/// Surfaces failures to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Desktop-only shells have no address bar to clean up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

impl BrowserLocation for NoBrowser {
    fn href(&self) -> String {
        String::new()
    }

    fn replace_url(&self, url: &str) {
        debug!("Ignoring URL rewrite to {url}: no browser location attached");
    }
}

/// Writes notices to the log when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        error!("{message}");
    }
}
