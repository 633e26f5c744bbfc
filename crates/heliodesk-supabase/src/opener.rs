//! Opening the provider's authorize page.

use anyhow::{Context, Result};

/// Navigates the user to a URL (system browser, webview, ...).
pub trait UrlOpener: Send + Sync {
    /// # Errors
    /// Returns an error if the URL could not be handed off.
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens URLs in the system's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl UrlOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        open::that(url).context("Failed to open the sign-in page in the browser")
    }
}
