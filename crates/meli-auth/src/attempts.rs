//! Server-side attempt cache and replay markers
//!
//! Two short-lived maps back the callback:
//! - pending attempts keyed by the `state` string, the server-side half of
//!   the secondary recovery channel (cookies are the other half);
//! - consumed markers keyed by correlation id, so a given attempt reaches
//!   the token endpoint at most once.
//!
//! Both expire lazily after the attempt lifetime. The in-memory store is
//! per instance; a shared implementation of [`AttemptStore`] extends replay
//! protection across a horizontally scaled deployment.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Boxed future used by the dyn-compatible store traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage for pending attempts and consumed markers.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn AttemptStore>`).
pub trait AttemptStore: Send + Sync {
    /// Mirror `verifier` under `state` for `ttl`.
    fn remember<'a>(
        &'a self,
        state: &'a str,
        verifier: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, ()>;

    /// Verifier mirrored under `state`, if still alive.
    fn recover<'a>(&'a self, state: &'a str) -> BoxFuture<'a, Option<String>>;

    /// Drop the pending entry for `state`.
    fn forget<'a>(&'a self, state: &'a str) -> BoxFuture<'a, ()>;

    /// Mark `key` as consumed for `ttl`. Returns `false` when it already was,
    /// which the caller treats as a replay. Check and insert are atomic.
    fn consume<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, bool>;
}

struct Pending {
    verifier: String,
    expires_at: Instant,
}

/// In-process [`AttemptStore`].
///
/// Expired entries are swept while the lock is held on each write.
#[derive(Default)]
pub struct MemoryAttemptStore {
    pending: Mutex<HashMap<String, Pending>>,
    consumed: Mutex<HashMap<String, Instant>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pending attempts.
    pub async fn pending_len(&self) -> usize {
        let now = Instant::now();
        let pending = self.pending.lock().await;
        pending.values().filter(|p| p.expires_at > now).count()
    }
}

impl AttemptStore for MemoryAttemptStore {
    fn remember<'a>(
        &'a self,
        state: &'a str,
        verifier: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let mut pending = self.pending.lock().await;
            pending.retain(|_, p| p.expires_at > now);
            pending.insert(
                state.to_owned(),
                Pending {
                    verifier: verifier.to_owned(),
                    expires_at: now + ttl,
                },
            );
        })
    }

    fn recover<'a>(&'a self, state: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let pending = self.pending.lock().await;
            pending
                .get(state)
                .filter(|p| p.expires_at > Instant::now())
                .map(|p| p.verifier.clone())
        })
    }

    fn forget<'a>(&'a self, state: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut pending = self.pending.lock().await;
            pending.remove(state);
        })
    }

    fn consume<'a>(&'a self, key: &'a str, ttl: Duration) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let now = Instant::now();
            let mut consumed = self.consumed.lock().await;
            consumed.retain(|_, expires_at| *expires_at > now);
            if consumed.contains_key(key) {
                debug!("attempt already consumed");
                return false;
            }
            consumed.insert(key.to_owned(), now + ttl);
            true
        })
    }
}
