//! Auth configuration for HelioDesk.
//!
//! Loads configuration from ${HELIODESK_HOME}/config.toml with sensible
//! defaults, then applies environment overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the backend URL.
pub const ENV_SUPABASE_URL: &str = "HELIODESK_SUPABASE_URL";
/// Environment variable overriding the backend anon key.
pub const ENV_SUPABASE_ANON_KEY: &str = "HELIODESK_SUPABASE_ANON_KEY";
/// Environment variable overriding the OAuth return URL.
pub const ENV_REDIRECT_URL: &str = "HELIODESK_REDIRECT_URL";

/// Main auth configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Backend project URL, e.g. `https://xyz.supabase.co`
    pub supabase_url: Option<String>,

    /// Public anon key sent as the `apikey` header
    pub supabase_anon_key: Option<String>,

    /// OAuth provider name passed to the authorize endpoint
    pub oauth_provider: String,

    /// Origin the provider redirects back to after consent
    pub redirect_url: String,

    /// Window in which repeated callbacks are treated as duplicates
    pub debounce_ms: u64,

    /// URL prefixes recognised as deep links in process arguments
    pub deep_link_schemes: Vec<String>,
}

impl AuthConfig {
    pub const DEFAULT_OAUTH_PROVIDER: &'static str = "google";
    pub const DEFAULT_REDIRECT_URL: &'static str = "http://localhost:5173";
    pub const DEFAULT_DEBOUNCE_MS: u64 = 1500;

    /// Loads configuration from the default path, then applies env overrides.
    ///
    /// # Errors
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Applies overrides from `lookup` (the process environment in production).
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_SUPABASE_URL) {
            self.supabase_url = Some(url);
        }
        if let Some(key) = non_empty(ENV_SUPABASE_ANON_KEY) {
            self.supabase_anon_key = Some(key);
        }
        if let Some(redirect) = non_empty(ENV_REDIRECT_URL) {
            self.redirect_url = redirect;
        }
    }

    /// Returns `(url, anon_key)` or an error when the backend is not configured.
    ///
    /// # Errors
    /// Returns an error if either value is missing.
    pub fn require_backend(&self) -> Result<(&str, &str)> {
        match (
            self.supabase_url.as_deref().filter(|v| !v.is_empty()),
            self.supabase_anon_key.as_deref().filter(|v| !v.is_empty()),
        ) {
            (Some(url), Some(key)) => Ok((url, key)),
            _ => bail!(
                "Missing Supabase configuration. Set {ENV_SUPABASE_URL} and \
                 {ENV_SUPABASE_ANON_KEY} or add supabase_url / supabase_anon_key to {}",
                paths::config_path().display()
            ),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            oauth_provider: Self::DEFAULT_OAUTH_PROVIDER.to_string(),
            redirect_url: Self::DEFAULT_REDIRECT_URL.to_string(),
            debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            deep_link_schemes: vec!["heliodesk://".to_string(), "tauri://".to_string()],
        }
    }
}

pub mod paths {
    //! Path resolution for HelioDesk configuration and data directories.
    //!
    //! HELIODESK_HOME resolution order:
    //! 1. HELIODESK_HOME environment variable (if set)
    //! 2. ~/.config/heliodesk (default)
    //! 3. ./.heliodesk when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the HelioDesk home directory.
    pub fn heliodesk_home() -> PathBuf {
        if let Ok(home) = std::env::var("HELIODESK_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".heliodesk"),
            |h| h.join(".config").join("heliodesk"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        heliodesk_home().join("config.toml")
    }

    /// Returns the directory for rolling log files.
    pub fn logs_dir() -> PathBuf {
        heliodesk_home().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AuthConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, AuthConfig::default());
        assert_eq!(config.debounce(), Duration::from_millis(1500));
        assert_eq!(config.oauth_provider, "google");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "supabase_url = \"https://demo.supabase.co\"\ndebounce_ms = 500\n",
        )
        .unwrap();

        let config = AuthConfig::load_from(&path).unwrap();
        assert_eq!(config.supabase_url.as_deref(), Some("https://demo.supabase.co"));
        assert_eq!(config.debounce_ms, 500);
        assert_eq!(config.redirect_url, AuthConfig::DEFAULT_REDIRECT_URL);
        assert_eq!(config.deep_link_schemes.len(), 2);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "debounce_ms = \"soon\"").unwrap();
        let err = AuthConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SUPABASE_URL, "https://env.supabase.co"),
            (ENV_SUPABASE_ANON_KEY, "anon"),
            (ENV_REDIRECT_URL, "  "),
        ]);
        let mut config = AuthConfig::default();
        config.apply_env_overrides(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.supabase_url.as_deref(), Some("https://env.supabase.co"));
        assert_eq!(config.supabase_anon_key.as_deref(), Some("anon"));
        assert_eq!(config.redirect_url, AuthConfig::DEFAULT_REDIRECT_URL);
    }

    #[test]
    fn test_require_backend() {
        let mut config = AuthConfig::default();
        assert!(config.require_backend().is_err());

        config.supabase_url = Some("https://demo.supabase.co".to_string());
        config.supabase_anon_key = Some("anon".to_string());
        assert_eq!(
            config.require_backend().unwrap(),
            ("https://demo.supabase.co", "anon")
        );
    }
}
