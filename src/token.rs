//! Login token store (component B): a short-lived, single-outstanding
//! token per handle used to drive out-of-band auto-login via [`crate::growl`].
//!
//! A linear scan over the map is deliberate — tokens are rare and short
//! lived, so a scan is simpler and cheap enough to skip a second index, the
//! same tradeoff the teacher's `store.rs` makes for its small in-memory
//! maps.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;

const TOKEN_LEN: usize = 32;
const CREATE_TTL: Duration = Duration::from_secs(2 * 60);
const REFRESH_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct TokenEntry {
    handle: String,
    expires: DateTime<Utc>,
}

/// Mutex-guarded map of live tokens, owned by a [`crate::room::Room`].
#[derive(Debug, Default)]
pub struct TokenStore {
    tokens: Mutex<HashMap<String, TokenEntry>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a token for `handle`, unless one is already live — in which case
    /// returns `None` so the growl flow can treat it as "already notified".
    pub async fn create_token(&self, handle: &str) -> Option<String> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;

        let already_live = tokens
            .values()
            .any(|e| e.handle == handle && e.expires > now);
        if already_live {
            return None;
        }

        let value: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();

        tokens.insert(
            value.clone(),
            TokenEntry {
                handle: handle.to_string(),
                expires: now + CREATE_TTL,
            },
        );
        Some(value)
    }

    /// Validate `value`; on a live match, refresh its expiry and return the
    /// handle it was minted for. Expired entries are left in place — they
    /// are simply treated as absent by both operations.
    pub async fn check_token(&self, value: &str) -> Option<String> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;
        let entry = tokens.get_mut(value)?;
        if entry.expires <= now {
            return None;
        }
        entry.expires = now + REFRESH_TTL;
        Some(entry.handle.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_check_resolves_handle() {
        let store = TokenStore::new();
        let token = store.create_token("alice").await.unwrap();
        let handle = store.check_token(&token).await.unwrap();
        assert_eq!(handle, "alice");
    }

    #[tokio::test]
    async fn second_create_while_live_returns_none() {
        let store = TokenStore::new();
        let first = store.create_token("alice").await;
        assert!(first.is_some());
        let second = store.create_token("alice").await;
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn unknown_token_returns_none() {
        let store = TokenStore::new();
        assert!(store.check_token("not-a-real-token").await.is_none());
    }

    #[tokio::test]
    async fn different_handles_can_both_have_live_tokens() {
        let store = TokenStore::new();
        assert!(store.create_token("alice").await.is_some());
        assert!(store.create_token("bob").await.is_some());
    }
}
