//! Per-tab session state.
//!
//! The token and user fields are mirrored into per-tab storage so that a
//! reload can restore them. Expiry fires its callback at most once per
//! session: the first 401 of a burst wins, the rest find the slot empty.

use crate::client::Inner;
use crate::executor::headers;
use crate::lock;
use serde_json::Value;
use skein_core::ports::Method;
use skein_core::session::fields;
use skein_core::{
    ClientError, ClientResult, KeyValueStorage, LoginOutcome, LoginRequest, Session, UserInfo,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Callback run on session expiry or logout.
pub type SessionCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ExpirySlot {
    callback: Option<SessionCallback>,
    armed: bool,
}

pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    current: Mutex<Option<Session>>,
    epoch: AtomicU64,
    expiry: Mutex<ExpirySlot>,
    on_logout: Mutex<Option<SessionCallback>>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
            expiry: Mutex::new(ExpirySlot {
                callback: None,
                armed: true,
            }),
            on_logout: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Session> {
        lock(&self.current).clone()
    }

    pub fn token(&self) -> Option<String> {
        lock(&self.current).as_ref().map(|s| s.token.clone())
    }

    pub fn user(&self) -> Option<UserInfo> {
        lock(&self.current).as_ref().map(|s| s.user.clone())
    }

    pub fn is_active(&self) -> bool {
        lock(&self.current).is_some()
    }

    /// Changes every time a session is established or cleared.
    ///
    /// Reads compare the epoch before and after the round trip and drop
    /// results that belong to a previous identity.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Make `session` current and persist it.
    pub fn establish(&self, session: Session) {
        self.persist(&session);
        *lock(&self.current) = Some(session);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Load a previously persisted session. False when storage holds no token.
    pub fn restore(&self) -> bool {
        let token = match self.storage.get(fields::TOKEN) {
            Some(token) if !token.is_empty() => token,
            _ => return false,
        };
        let user = UserInfo {
            username: self.storage.get(fields::USERNAME).unwrap_or_default(),
            email: self.storage.get(fields::EMAIL).unwrap_or_default(),
            role: self.storage.get(fields::ROLE).unwrap_or_default(),
        };
        *lock(&self.current) = Some(Session { token, user });
        self.epoch.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Replace the user fields of the current session. No-op without one.
    pub fn update_user(&self, user: UserInfo) {
        let updated = {
            let mut current = lock(&self.current);
            match current.as_mut() {
                Some(session) => {
                    session.user = user;
                    Some(session.clone())
                }
                None => None,
            }
        };
        if let Some(session) = updated {
            self.persist(&session);
        }
    }

    /// Forget the session in memory and in storage.
    pub fn clear(&self) {
        *lock(&self.current) = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for field in fields::ALL {
            if let Err(err) = self.storage.remove(field) {
                tracing::warn!(field, error = %err, "Failed to clear session field");
            }
        }
    }

    fn persist(&self, session: &Session) {
        let values = [
            (fields::TOKEN, session.token.as_str()),
            (fields::USERNAME, session.user.username.as_str()),
            (fields::EMAIL, session.user.email.as_str()),
            (fields::ROLE, session.user.role.as_str()),
        ];
        for (field, value) in values {
            if let Err(err) = self.storage.set(field, value) {
                tracing::warn!(field, error = %err, "Failed to persist session field");
            }
        }
    }

    /// Register the expiry callback. Arming is left to the session lifecycle.
    pub fn set_on_expired(&self, callback: SessionCallback) {
        lock(&self.expiry).callback = Some(callback);
    }

    /// Disarm expiry and hand back the callback, if this is the first expiry
    /// since the last login.
    pub fn take_expiry_callback(&self) -> Option<SessionCallback> {
        let mut slot = lock(&self.expiry);
        if !slot.armed {
            return None;
        }
        slot.armed = false;
        slot.callback.clone()
    }

    /// Arm expiry again. Called when a new session begins.
    pub fn rearm(&self) {
        lock(&self.expiry).armed = true;
    }

    pub fn set_on_logout(&self, callback: SessionCallback) {
        *lock(&self.on_logout) = Some(callback);
    }

    pub fn on_logout(&self) -> Option<SessionCallback> {
        lock(&self.on_logout).clone()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("active", &self.is_active())
            .field("epoch", &self.epoch())
            .finish()
    }
}

// ============================================================================
// SESSION LIFECYCLE
// ============================================================================

impl Inner {
    /// Post credentials. A rejected login is an outcome, not an error.
    pub(crate) async fn login(&self, username: &str, password: &str) -> ClientResult<LoginOutcome> {
        let body = serde_json::to_value(LoginRequest { username, password })?;
        let response = self
            .executor
            .write(Method::POST, &self.config.login_path, None, Some(&body))
            .await?;
        if !response.is_success() {
            tracing::info!(username, status = response.status, "Login rejected");
            return Ok(LoginOutcome {
                status: response.status,
                user: None,
            });
        }

        let body = response.body_json()?;
        let token = body
            .get(fields::TOKEN)
            .and_then(Value::as_str)
            .or_else(|| response.header(headers::AUTH_TOKEN))
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode("login response carries no token".to_string()))?;
        let mut user: UserInfo = serde_json::from_value(body).unwrap_or_default();
        if user.username.is_empty() {
            user.username = username.to_string();
        }

        self.loading.clear();
        self.cache.clear();
        self.session.establish(Session {
            token,
            user: user.clone(),
        });
        self.session.rearm();
        self.coordinator.session_started();
        tracing::info!(tab_id = %self.tab_id, username = %user.username, "Logged in");

        Ok(LoginOutcome {
            status: response.status,
            user: Some(user),
        })
    }

    /// Tell the server (best effort), then forget everything tied to the session.
    pub(crate) async fn logout(&self) {
        let token = self.session.token();
        if token.is_some() {
            match self
                .executor
                .write(Method::POST, &self.config.logout_path, token.as_deref(), None)
                .await
            {
                Ok(response) if !response.is_success() => {
                    tracing::warn!(status = response.status, "Logout rejected by server");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!(error = %err, "Logout request failed"),
            }
        }

        self.end_session();
        self.session.rearm();
        tracing::info!(tab_id = %self.tab_id, "Logged out");
        if let Some(callback) = self.session.on_logout() {
            callback();
        }
    }

    /// Confirm a restored session with the server. Expires it when rejected.
    pub(crate) async fn test_restored_session(&self) -> bool {
        let Some(token) = self.session.token() else {
            return false;
        };
        let response = self
            .executor
            .write(Method::GET, &self.config.whoami_path, Some(&token), None)
            .await;

        match response {
            Ok(response) if response.is_success() => {
                match response.body_json().map(serde_json::from_value::<UserInfo>) {
                    Ok(Ok(user)) => self.session.update_user(user),
                    _ => tracing::debug!("Identity response without user fields"),
                }
                self.session.rearm();
                self.coordinator.session_started();
                true
            }
            Ok(response) => {
                tracing::info!(status = response.status, "Restored session rejected");
                self.session_expired();
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "Restored session could not be confirmed");
                self.session_expired();
                false
            }
        }
    }

    /// The server rejected the credential. Clears state every time, runs the
    /// expiry callback only for the first rejection.
    pub(crate) fn session_expired(&self) {
        self.end_session();
        match self.session.take_expiry_callback() {
            Some(callback) => {
                tracing::info!(tab_id = %self.tab_id, "Session expired");
                callback();
            }
            None => tracing::debug!(tab_id = %self.tab_id, "Session already expired"),
        }
    }

    fn end_session(&self) {
        self.session.clear();
        self.cache.clear();
        self.loading.clear();
        self.coordinator.session_ended();
    }
}
