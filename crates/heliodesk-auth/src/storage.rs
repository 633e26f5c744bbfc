//! Two-tier key/value storage for session material and auth flags.
//!
//! The durable tier is a JSON map in `<base>/auth.json` with restricted
//! permissions (0600); the session tier lives in memory and is gone after a
//! restart. Session material goes to exactly one tier, picked by the
//! remember-me flag on every read and write. Removal clears both tiers.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use tracing::warn;

/// Durable key recording the user's remember-me choice.
pub const REMEMBER_ME_KEY: &str = "heliodesk_remember_me";
/// Durable key marking a sign-in that is waiting for its callback.
pub const SIGNING_IN_KEY: &str = "heliodesk_signing_in";
/// Durable storage filename.
const AUTH_STORE_FILE: &str = "auth.json";

/// A string key/value store.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;

    /// # Errors
    /// Returns an error if the value cannot be persisted.
    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// # Errors
    /// Returns an error if the removal cannot be persisted.
    fn remove_item(&self, key: &str) -> Result<()>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Process-lifetime store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct SessionStore {
    items: Mutex<HashMap<String, String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for SessionStore {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        lock(&self.items).remove(key);
        Ok(())
    }
}

/// File-backed store. Every change is written through to disk.
#[derive(Debug)]
pub struct DurableStore {
    path: PathBuf,
    items: Mutex<HashMap<String, String>>,
}

impl DurableStore {
    /// Opens (or prepares) the store at `<dir>/auth.json`.
    ///
    /// # Errors
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(AUTH_STORE_FILE);
        let items = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read auth store from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse auth store from {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, items: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(items).context("Failed to serialize auth store")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.path, contents)
                .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        }

        Ok(())
    }
}

impl KeyValueStore for DurableStore {
    fn get_item(&self, key: &str) -> Option<String> {
        lock(&self.items).get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = lock(&self.items);
        items.insert(key.to_string(), value.to_string());
        self.save(&items)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut items = lock(&self.items);
        if items.remove(key).is_some() {
            self.save(&items)?;
        }
        Ok(())
    }
}

/// Tier-selecting storage shared by the reconciler and the backend client.
#[derive(Clone)]
pub struct AuthStorage {
    durable: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
}

impl AuthStorage {
    pub fn new(durable: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, session }
    }

    /// Durable tier under `dir`, fresh session tier.
    ///
    /// # Errors
    /// Returns an error if the durable store cannot be loaded.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self::new(
            Arc::new(DurableStore::open(dir)?),
            Arc::new(SessionStore::new()),
        ))
    }

    /// Both tiers in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(SessionStore::new()), Arc::new(SessionStore::new()))
    }

    fn active_tier(&self) -> &dyn KeyValueStore {
        if self.remember_me() {
            self.durable.as_ref()
        } else {
            self.session.as_ref()
        }
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.active_tier().get_item(key)
    }

    /// # Errors
    /// Returns an error if the active tier cannot persist the value.
    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.active_tier().set_item(key, value)
    }

    /// Removes `key` from both tiers so no stale copy is left behind.
    ///
    /// # Errors
    /// Returns an error if the durable tier cannot persist the removal.
    pub fn remove_item(&self, key: &str) -> Result<()> {
        self.session.remove_item(key)?;
        self.durable.remove_item(key)
    }

    pub fn remember_me(&self) -> bool {
        self.durable.get_item(REMEMBER_ME_KEY).as_deref() == Some("true")
    }

    /// # Errors
    /// Returns an error if the flag cannot be persisted.
    pub fn set_remember_me(&self, remember: bool) -> Result<()> {
        self.durable
            .set_item(REMEMBER_ME_KEY, if remember { "true" } else { "false" })
    }

    pub fn is_signing_in(&self) -> bool {
        self.durable.get_item(SIGNING_IN_KEY).as_deref() == Some("true")
    }

    /// # Errors
    /// Returns an error if the flag cannot be persisted.
    pub fn set_signing_in(&self) -> Result<()> {
        self.durable.set_item(SIGNING_IN_KEY, "true")
    }

    /// Clears the signing-in flag. Failures are logged, never propagated:
    /// callers use this on terminal paths that must not fail.
    pub fn clear_signing_in(&self) {
        if let Err(e) = self.durable.remove_item(SIGNING_IN_KEY) {
            warn!("Failed to clear signing-in flag: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const SESSION_KEY: &str = "sb-test-auth-token";

    #[test]
    fn test_writes_go_to_one_tier() {
        let durable = Arc::new(SessionStore::new());
        let session = Arc::new(SessionStore::new());
        let storage = AuthStorage::new(Arc::clone(&durable) as _, Arc::clone(&session) as _);

        storage.set_item(SESSION_KEY, "scoped").unwrap();
        assert_eq!(session.get_item(SESSION_KEY).as_deref(), Some("scoped"));
        assert_eq!(durable.get_item(SESSION_KEY), None);

        storage.set_remember_me(true).unwrap();
        storage.set_item(SESSION_KEY, "kept").unwrap();
        assert_eq!(durable.get_item(SESSION_KEY).as_deref(), Some("kept"));
        assert_eq!(storage.get_item(SESSION_KEY).as_deref(), Some("kept"));
    }

    #[test]
    fn test_remove_clears_both_tiers() {
        let durable = Arc::new(SessionStore::new());
        let session = Arc::new(SessionStore::new());
        let storage = AuthStorage::new(Arc::clone(&durable) as _, Arc::clone(&session) as _);

        storage.set_item(SESSION_KEY, "scoped").unwrap();
        storage.set_remember_me(true).unwrap();
        storage.set_item(SESSION_KEY, "kept").unwrap();

        storage.remove_item(SESSION_KEY).unwrap();
        assert_eq!(durable.get_item(SESSION_KEY), None);
        assert_eq!(session.get_item(SESSION_KEY), None);
    }

    #[test]
    fn test_remember_me_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let storage = AuthStorage::open(dir.path()).unwrap();
            storage.set_remember_me(true).unwrap();
            storage.set_item(SESSION_KEY, "session-json").unwrap();
        }

        let restarted = AuthStorage::open(dir.path()).unwrap();
        assert!(restarted.remember_me());
        assert_eq!(
            restarted.get_item(SESSION_KEY).as_deref(),
            Some("session-json")
        );
    }

    #[test]
    fn test_session_scoped_does_not_survive_restart() {
        let dir = TempDir::new().unwrap();
        {
            let storage = AuthStorage::open(dir.path()).unwrap();
            storage.set_remember_me(false).unwrap();
            storage.set_item(SESSION_KEY, "session-json").unwrap();
            assert_eq!(
                storage.get_item(SESSION_KEY).as_deref(),
                Some("session-json")
            );
        }

        let restarted = AuthStorage::open(dir.path()).unwrap();
        assert!(!restarted.remember_me());
        assert_eq!(restarted.get_item(SESSION_KEY), None);
    }

    #[test]
    fn test_signing_in_flag() {
        let storage = AuthStorage::in_memory();
        assert!(!storage.is_signing_in());
        storage.set_signing_in().unwrap();
        assert!(storage.is_signing_in());
        storage.clear_signing_in();
        assert!(!storage.is_signing_in());
    }

    #[cfg(unix)]
    #[test]
    fn test_durable_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = DurableStore::open(dir.path()).unwrap();
        store.set_item("k", "v").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_durable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(AUTH_STORE_FILE), "not json").unwrap();
        assert!(DurableStore::open(dir.path()).is_err());
    }
}
