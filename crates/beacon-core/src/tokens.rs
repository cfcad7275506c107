//! Session-identifying token storage.
//!
//! A successful session-establishing request yields the tokens stored here;
//! the queue's eligibility checks and the stuck-lock recovery policy both
//! consult this store as the verified session truth.

use std::sync::{Arc, RwLock};

/// Tokens identifying an established session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTokens {
    /// Identifier of the current logical session.
    pub session_id: Option<String>,
    /// Stable per-device token issued at install registration.
    pub device_token: Option<String>,
    /// Token tying the session to a developer-set identity, if any.
    pub identity_token: Option<String>,
}

impl SessionTokens {
    /// A session is usable for dispatch once both the session id and the
    /// device token are present.
    pub fn is_session_valid(&self) -> bool {
        self.session_id.is_some() && self.device_token.is_some()
    }
}

/// Shared, thread-safe token store.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<SessionTokens>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_session(&self) -> bool {
        self.read().session_id.is_some()
    }

    pub fn has_device_token(&self) -> bool {
        self.read().device_token.is_some()
    }

    pub fn has_identity(&self) -> bool {
        self.read().identity_token.is_some()
    }

    /// Check whether the stored tokens constitute a dispatchable session
    pub fn is_session_valid(&self) -> bool {
        self.read().is_session_valid()
    }

    /// Get a copy of the current tokens
    pub fn snapshot(&self) -> SessionTokens {
        self.read()
    }

    pub fn set_session_id(&self, session_id: impl Into<String>) {
        self.write().session_id = Some(session_id.into());
    }

    pub fn set_device_token(&self, device_token: impl Into<String>) {
        self.write().device_token = Some(device_token.into());
    }

    pub fn set_identity_token(&self, identity_token: impl Into<String>) {
        self.write().identity_token = Some(identity_token.into());
    }

    pub fn clear_identity_token(&self) {
        self.write().identity_token = None;
    }

    /// Drop all tokens (session teardown / tracking disabled)
    pub fn clear(&self) {
        *self.write() = SessionTokens::default();
    }

    fn read(&self) -> SessionTokens {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionTokens> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
