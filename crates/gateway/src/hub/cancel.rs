//! Per-session run cancellation.
//!
//! Each active run registers a [`CancelToken`]; `cancel_active_run` fires
//! it and the run loop observes the signal at its next suspension point,
//! emitting the closing event sequence before unwinding.

use std::collections::HashMap;

use parking_lot::Mutex;

use parlor_domain::cancel::CancelToken;

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a session's run.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(session_id.to_owned(), token.clone());
        token
    }

    /// Fire the session's token. Returns whether a run was registered.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.tokens.lock().get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the token when a run finishes.
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }
}
