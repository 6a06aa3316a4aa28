//! Session state for the codeforge client.
//!
//! Tracks the authenticated, time-bounded relationship with the server:
//! session token, expiry, and user identity. The state is an explicitly
//! owned context object shared by handle; components that need session data
//! take a reference instead of reaching into a global.
//!
//! Saved credentials (for auto-login) and a best-effort session cache are
//! persisted through [`CredentialStore`]; the cached token is never trusted
//! as a valid session without a fresh login.

mod store;

pub use store::{default_store_path, CredentialStore, SavedCredentials};

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::LoginResponse;

/// In-memory session fields. Mutated only through [`SessionState`] methods.
#[derive(Debug, Default, Clone)]
struct SessionFields {
    session_id: String,
    user_nickname: String,
    user_role: u32,
    /// Expiry as epoch seconds.
    expire_time: i64,
    logged_in: bool,
}

/// Shared session context.
///
/// `logged_in` is derived: a token is present *and* the current time is
/// before `expire_time`. All mutation happens in response to a login
/// response, a logout, or a token refresh.
#[derive(Debug)]
pub struct SessionState {
    fields: Mutex<SessionFields>,
    store: CredentialStore,
}

impl SessionState {
    pub fn new(store: CredentialStore) -> Self {
        SessionState {
            fields: Mutex::new(SessionFields::default()),
            store,
        }
    }

    /// Whether the session is currently authenticated and unexpired.
    pub fn is_logged_in(&self) -> bool {
        let fields = self.lock();
        fields.logged_in && Utc::now().timestamp() < fields.expire_time
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone()
    }

    pub fn user_nickname(&self) -> String {
        self.lock().user_nickname.clone()
    }

    pub fn user_role(&self) -> u32 {
        self.lock().user_role
    }

    /// Session expiry as epoch seconds (0 when logged out).
    pub fn expire_time(&self) -> i64 {
        self.lock().expire_time
    }

    /// The auth token to stamp into outgoing request headers:
    /// `Some(session_id)` while logged in, `None` otherwise.
    pub fn auth_token(&self) -> Option<String> {
        let fields = self.lock();
        if fields.logged_in && Utc::now().timestamp() < fields.expire_time {
            Some(fields.session_id.clone())
        } else {
            None
        }
    }

    /// Whether less than `margin` remains before expiry.
    ///
    /// Only meaningful while logged in; returns false otherwise.
    pub fn expires_within(&self, margin: Duration) -> bool {
        let fields = self.lock();
        if !fields.logged_in {
            return false;
        }
        Utc::now().timestamp() + margin.as_secs() as i64 >= fields.expire_time
    }

    /// Adopt the fields of a login response.
    ///
    /// On success the session cache is persisted best-effort; the cached
    /// values are refreshed to the server-provided ones on every login.
    pub fn apply_login(&self, response: &LoginResponse) {
        {
            let mut fields = self.lock();
            fields.session_id = response.session_id.clone();
            fields.expire_time = response.expire_time;
            fields.user_nickname = response.user_nickname.clone();
            fields.user_role = response.user_role;
            fields.logged_in = response.success;
        }

        if response.success {
            info!(
                "Session established for {} (expires at {})",
                response.user_nickname, response.expire_time
            );
            self.store
                .cache_session(&response.session_id, response.expire_time);
        }
    }

    /// Clear all session fields and the persisted session cache.
    pub fn clear(&self) {
        {
            let mut fields = self.lock();
            *fields = SessionFields::default();
        }
        self.store.clear_session_cache();
        info!("Session cleared");
    }

    /// Adopt a refreshed token and expiry from the server.
    pub fn update_session(&self, new_session_id: &str, new_expire_time: i64) {
        {
            let mut fields = self.lock();
            fields.session_id = new_session_id.to_string();
            fields.expire_time = new_expire_time;
        }
        self.store.cache_session(new_session_id, new_expire_time);
        debug!("Session token refreshed (expires at {})", new_expire_time);
    }

    /// Generate a request id unique with overwhelming probability across the
    /// process lifetime.
    pub fn generate_request_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    // -------------------------------------------------------------------------
    // Credential persistence passthrough
    // -------------------------------------------------------------------------

    /// Persist credentials for later auto-login.
    pub fn save_credentials(&self, username: &str, password_hash: &str) {
        self.store.save_credentials(username, password_hash);
    }

    /// Load previously saved credentials, if any.
    pub fn load_credentials(&self) -> Option<SavedCredentials> {
        self.store.load_credentials()
    }

    /// Remove saved credentials.
    pub fn clear_credentials(&self) {
        self.store.clear_credentials();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionFields> {
        self.fields.lock().expect("session lock poisoned")
    }
}
