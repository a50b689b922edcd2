//! Process-wide authentication session.
//!
//! The bearer token is read from its store once, when the session is opened.
//! Any 401 seen by any request expires the session for the whole process:
//! the stored token is removed and every subscriber is told to send the
//! operator to the login entry point.

use crate::api::ResponseHook;
use crate::storage::{StoreError, TokenStore};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired { login_url: String },
}

pub struct Session {
    store: Arc<dyn TokenStore>,
    token: Option<String>,
    login_url: String,
    state: watch::Sender<SessionState>,
}

impl Session {
    pub fn open(
        store: Arc<dyn TokenStore>,
        login_url: impl Into<String>,
    ) -> Result<Arc<Self>, StoreError> {
        let token = store.load()?;
        let (state, _) = watch::channel(SessionState::Active);
        Ok(Arc::new(Self {
            store,
            token,
            login_url: login_url.into(),
            state,
        }))
    }

    /// Token captured when the session was opened.
    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn login_url(&self) -> &str {
        &self.login_url
    }

    pub fn is_expired(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Expired { .. })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Expire the session. Only the first call has an effect; returns whether
    /// this call was the one that expired it.
    pub fn invalidate(&self) -> bool {
        let login_url = self.login_url.clone();
        let expired_now = self.state.send_if_modified(|state| {
            if *state == SessionState::Active {
                *state = SessionState::Expired { login_url };
                true
            } else {
                false
            }
        });

        if !expired_now {
            debug!("session already expired");
            return false;
        }

        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear stored token");
        }
        info!(login_url = %self.login_url, "session expired, login required");
        true
    }
}

impl ResponseHook for Session {
    fn on_response(&self, method: &Method, path: &str, status: StatusCode) {
        if status == StatusCode::UNAUTHORIZED {
            warn!(%method, path, "request rejected as unauthorized");
            self.invalidate();
        }
    }
}
