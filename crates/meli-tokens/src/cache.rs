//! Access token cache
//!
//! Subject -> access token, each entry living exactly as long as the token.
//! Owned by whoever builds the [`TokenProvider`](crate::TokenProvider), so
//! tests and separate gateways never share entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meli_auth::Clock;
use tokio::sync::RwLock;

struct Entry {
    access_token: String,
    expires_at: u64,
}

pub struct TokenCache {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Cached token for `subject_id` if it stays valid for at least `margin`.
    ///
    /// Entries past their expiry are evicted on the way out.
    pub async fn get(&self, subject_id: &str, margin: Duration) -> Option<String> {
        let now = self.clock.now_millis();
        {
            let entries = self.entries.read().await;
            match entries.get(subject_id) {
                None => return None,
                Some(e) if e.expires_at > now.saturating_add(margin.as_millis() as u64) => {
                    return Some(e.access_token.clone());
                }
                Some(e) if e.expires_at > now => return None,
                Some(_) => {}
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(subject_id).is_some_and(|e| e.expires_at <= now) {
            entries.remove(subject_id);
        }
        None
    }

    /// Cache `access_token` until `expires_at` (unix millis). Already-expired
    /// tokens are not stored.
    pub async fn insert(&self, subject_id: &str, access_token: String, expires_at: u64) {
        let mut entries = self.entries.write().await;
        if expires_at <= self.clock.now_millis() {
            entries.remove(subject_id);
            return;
        }
        entries.insert(
            subject_id.to_owned(),
            Entry {
                access_token,
                expires_at,
            },
        );
    }

    pub async fn evict(&self, subject_id: &str) {
        self.entries.write().await.remove(subject_id);
    }

    /// Number of entries, expired ones included until next touched.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
