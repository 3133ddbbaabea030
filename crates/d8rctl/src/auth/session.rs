// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory web sessions.
//!
//! Login exchanges a password for an opaque token carried in a cookie.
//! Sessions expire after 24 hours; a background sweep drops expired
//! entries so the map stays bounded.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const SESSION_COOKIE: &str = "session_token";

struct SessionEntry {
    expires_at: Instant,
}

/// Token -> session map with TTL.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Create a new session and return its token.
    pub fn create(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.sessions
            .write()
            .expect("session store lock poisoned")
            .insert(
                token.clone(),
                SessionEntry {
                    expires_at: Instant::now() + self.ttl,
                },
            );
        token
    }

    /// A token is valid if it exists and has not expired.
    pub fn validate(&self, token: &str) -> bool {
        let sessions = self.sessions.read().expect("session store lock poisoned");
        match sessions.get(token) {
            Some(entry) => entry.expires_at > Instant::now(),
            None => false,
        }
    }

    pub fn delete(&self, token: &str) {
        self.sessions
            .write()
            .expect("session store lock poisoned")
            .remove(token);
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.write().expect("session store lock poisoned");
        let before = sessions.len();
        let now = Instant::now();
        sessions.retain(|_, entry| entry.expires_at > now);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .expect("session store lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run the expiry sweep until the token is cancelled.
pub fn spawn_session_sweeper(store: Arc<SessionStore>, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("session sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let removed = store.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "expired sessions swept");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate() {
        let store = SessionStore::default();
        let token = store.create();
        assert!(store.validate(&token));
        assert!(!store.validate("bogus"));
    }

    #[test]
    fn test_tokens_are_unique() {
        let store = SessionStore::default();
        let a = store.create();
        let b = store.create();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_delete_invalidates() {
        let store = SessionStore::default();
        let token = store.create();
        store.delete(&token);
        assert!(!store.validate(&token));
    }

    #[test]
    fn test_expired_session_rejected_and_swept() {
        let store = SessionStore::new(Duration::from_millis(0));
        let token = store.create();
        std::thread::sleep(Duration::from_millis(5));

        assert!(!store.validate(&token));
        assert_eq!(store.sweep_expired(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_sessions() {
        let store = SessionStore::default();
        let token = store.create();
        assert_eq!(store.sweep_expired(), 0);
        assert!(store.validate(&token));
    }
}
