//! Signed-in user context shared by the backend clients.
//!
//! Sign-in itself happens elsewhere. This handle only carries the resulting
//! identity and bearer token so that REST, realtime and function calls agree
//! on who is acting.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Identity and credentials of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub access_token: String,
    /// Token expiry, when known.
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    /// Whether the token is still usable at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.user_id.is_empty()
            && !self.access_token.is_empty()
            && self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Cloneable handle to the current session. Empty when signed out.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<AuthContext>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(context: AuthContext) -> Self {
        let handle = Self::default();
        handle.set(context);
        handle
    }

    pub fn set(&self, context: AuthContext) {
        *self.inner.write() = Some(context);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }

    /// The current session if one exists and has not expired.
    pub fn current(&self) -> Option<AuthContext> {
        self.inner
            .read()
            .clone()
            .filter(|context| context.is_valid_at(Utc::now()))
    }

    pub fn user_id(&self) -> Option<String> {
        self.current().map(|context| context.user_id)
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|context| context.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn empty_handle_has_no_session() {
        let handle = SessionHandle::new();
        assert!(handle.current().is_none());
        assert!(handle.user_id().is_none());
    }

    #[test]
    fn clones_share_state() {
        let handle = SessionHandle::new();
        let clone = handle.clone();
        handle.set(AuthContext::new("user-1", "token"));
        assert_eq!(clone.user_id().as_deref(), Some("user-1"));

        clone.clear();
        assert!(handle.current().is_none());
    }

    #[test]
    fn expired_session_is_treated_as_signed_out() {
        let mut context = AuthContext::new("user-1", "token");
        context.expires_at = Some(Utc::now() - Duration::seconds(5));
        let handle = SessionHandle::signed_in(context);
        assert!(handle.current().is_none());
    }

    #[test]
    fn empty_token_is_invalid() {
        let context = AuthContext::new("user-1", "");
        assert!(!context.is_valid_at(Utc::now()));
    }
}
