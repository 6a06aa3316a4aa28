//! Persistent credential and session-cache storage.
//!
//! A small JSON file keeps the saved username/password hash for auto-login,
//! plus a best-effort copy of the last session id and expiry. The cached
//! session is informational only; it is refreshed from the server on every
//! login and never used without one.
//!
//! Persistence failures are logged and swallowed: losing the convenience
//! cache must never take the engine down.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Credentials previously saved for auto-login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedCredentials {
    pub username: String,
    /// Salted hash as originally supplied by the caller; stored verbatim so
    /// auto-login can replay it.
    pub password_hash: String,
}

/// On-disk layout of the store file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoredState {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password_hash: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    session_expire: Option<i64>,
}

/// Resolve the default store file path.
///
/// Resolution order:
/// 1. `$CODEFORGE_CONFIG_DIR/credentials.json` (explicit override)
/// 2. `<config dir>/codeforge/credentials.json` (XDG on Linux, Library on macOS)
/// 3. `/tmp/codeforge-credentials.json` (fallback)
pub fn default_store_path() -> PathBuf {
    if let Ok(dir) = std::env::var("CODEFORGE_CONFIG_DIR") {
        return PathBuf::from(dir).join("credentials.json");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("codeforge").join("credentials.json");
    }

    PathBuf::from("/tmp/codeforge-credentials.json")
}

/// File-backed credential and session-cache store.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Open the store at the default path.
    pub fn open_default() -> Self {
        Self::at_path(default_store_path())
    }

    /// Open the store at an explicit path.
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        CredentialStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist credentials for auto-login.
    pub fn save_credentials(&self, username: &str, password_hash: &str) {
        self.mutate(|state| {
            state.username = Some(username.to_string());
            state.password_hash = Some(password_hash.to_string());
        });
    }

    /// Load saved credentials; `None` when nothing usable is stored.
    pub fn load_credentials(&self) -> Option<SavedCredentials> {
        let state = self.read();
        match (state.username, state.password_hash) {
            (Some(username), Some(password_hash))
                if !username.is_empty() && !password_hash.is_empty() =>
            {
                Some(SavedCredentials {
                    username,
                    password_hash,
                })
            }
            _ => None,
        }
    }

    /// Remove saved credentials, keeping any cached session.
    pub fn clear_credentials(&self) {
        self.mutate(|state| {
            state.username = None;
            state.password_hash = None;
        });
    }

    /// Record the latest session id and expiry (best-effort cache).
    pub fn cache_session(&self, session_id: &str, expire_time: i64) {
        self.mutate(|state| {
            state.session_id = Some(session_id.to_string());
            state.session_expire = Some(expire_time);
        });
    }

    /// The cached session, if one was recorded. Not a valid session; a
    /// fresh login is always required.
    pub fn cached_session(&self) -> Option<(String, i64)> {
        let state = self.read();
        match (state.session_id, state.session_expire) {
            (Some(id), Some(expire)) if !id.is_empty() => Some((id, expire)),
            _ => None,
        }
    }

    /// Drop the cached session.
    pub fn clear_session_cache(&self) {
        self.mutate(|state| {
            state.session_id = None;
            state.session_expire = None;
        });
    }

    fn read(&self) -> StoredState {
        match self.try_read() {
            Ok(state) => state,
            Err(e) => {
                debug!("Credential store unreadable ({e:#}); treating as empty");
                StoredState::default()
            }
        }
    }

    fn try_read(&self) -> Result<StoredState> {
        if !self.path.exists() {
            return Ok(StoredState::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoredState)) {
        let mut state = self.read();
        apply(&mut state);
        if let Err(e) = self.try_write(&state) {
            warn!("Failed to persist credential store: {e:#}");
        }
    }

    fn try_write(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(state).context("failed to serialize store")?;
        fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}
