//! Access token provider with lazy renewal
//!
//! Hands out a usable access token for a subject. The cache is checked
//! first; on a miss the credential is loaded from the store and, when it
//! expires within the skew window, refreshed inline and written back. A
//! refresh token rejected by Mercado Livre deactivates the credential.
//!
//! Refreshes, revocations and newly exchanged credentials are serialized
//! through one lock. Mercado Livre rotates refresh tokens on every use, so
//! two concurrent refreshes for the same subject would invalidate each
//! other. A refresh writes back through `update_active` and never
//! reactivates a revoked credential.

use std::sync::Arc;
use std::time::Duration;

use meli_auth::{
    Clock, Credential, CredentialStore, REFRESH_MAX_ATTEMPTS, REFRESH_RETRY_DELAY, REFRESH_SKEW,
    TokenClient,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::TokenCache;
use crate::error::{Error, Result};

pub struct TokenProvider {
    store: Arc<dyn CredentialStore>,
    client: Arc<TokenClient>,
    cache: TokenCache,
    clock: Arc<dyn Clock>,
    skew: Duration,
    refresh_lock: Mutex<()>,
}

impl TokenProvider {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: Arc<TokenClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            client,
            cache: TokenCache::new(clock.clone()),
            clock,
            skew: REFRESH_SKEW,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Override how close to expiry a token may get before it is refreshed.
    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn credential_store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// A usable access token for `subject_id`, refreshing it if needed.
    pub async fn access_token(&self, subject_id: &str) -> Result<String> {
        if let Some(token) = self.cache.get(subject_id, self.skew).await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(token) = self.cache.get(subject_id, self.skew).await {
            return Ok(token);
        }

        let credential = self.active_credential(subject_id).await?;
        if !credential.expires_within(self.clock.now_millis(), self.skew) {
            self.cache
                .insert(
                    subject_id,
                    credential.access_token.clone(),
                    credential.expires_at,
                )
                .await;
            return Ok(credential.access_token);
        }

        debug!(subject_id, "access token expiring soon, refreshing inline");
        let refreshed = self.refresh_credential(&credential).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh regardless of remaining lifetime.
    pub async fn refresh_now(&self, subject_id: &str) -> Result<Credential> {
        let _guard = self.refresh_lock.lock().await;
        let credential = self.active_credential(subject_id).await?;
        self.refresh_credential(&credential).await
    }

    /// Refresh only if the token expires within `threshold`. Returns the
    /// updated credential when a refresh happened.
    pub async fn refresh_if_expiring(
        &self,
        subject_id: &str,
        threshold: Duration,
    ) -> Result<Option<Credential>> {
        let _guard = self.refresh_lock.lock().await;
        let credential = self.active_credential(subject_id).await?;
        if !credential.expires_within(self.clock.now_millis(), threshold) {
            return Ok(None);
        }
        self.refresh_credential(&credential).await.map(Some)
    }

    /// A callback exchange just stored `credential`. Replaces whatever token
    /// was cached for the subject.
    pub async fn on_exchanged(&self, credential: &Credential) {
        let _guard = self.refresh_lock.lock().await;
        let subject_id = credential.subject_id.as_str();
        self.cache.evict(subject_id).await;
        if credential.is_active {
            self.cache
                .insert(
                    subject_id,
                    credential.access_token.clone(),
                    credential.expires_at,
                )
                .await;
        }
        debug!(subject_id, "token cache updated after exchange");
    }

    /// The marketplace rejected this subject's token on use.
    pub async fn report_unauthorized(&self, subject_id: &str) -> Result<bool> {
        warn!(subject_id, "access token rejected upstream, deactivating credential");
        self.revoke(subject_id).await
    }

    /// Deactivate the credential and drop any cached token. Returns whether
    /// a credential existed. Waits for an in-flight refresh to finish.
    pub async fn revoke(&self, subject_id: &str) -> Result<bool> {
        let _guard = self.refresh_lock.lock().await;
        self.deactivate(subject_id).await
    }

    /// Caller holds `refresh_lock`.
    async fn deactivate(&self, subject_id: &str) -> Result<bool> {
        self.cache.evict(subject_id).await;
        self.store
            .deactivate(subject_id)
            .await
            .map_err(|e| Error::Credential(e.to_string()))
    }

    async fn active_credential(&self, subject_id: &str) -> Result<Credential> {
        match self.store.get(subject_id).await {
            Some(c) if c.is_active => Ok(c),
            Some(_) => Err(Error::Revoked(subject_id.to_owned())),
            None => Err(Error::NotFound(subject_id.to_owned())),
        }
    }

    async fn refresh_credential(&self, credential: &Credential) -> Result<Credential> {
        let subject_id = credential.subject_id.as_str();
        let Some(refresh_token) = credential.refresh_token.as_deref() else {
            record_refresh("no_refresh_token");
            return Err(Error::RefreshFailed(format!(
                "subject {subject_id} has no refresh token"
            )));
        };

        let now = self.clock.now_millis();
        match self
            .client
            .refresh_with_retry(refresh_token, REFRESH_MAX_ATTEMPTS, REFRESH_RETRY_DELAY)
            .await
        {
            Ok(token) => {
                let Some(updated) = self
                    .store
                    .update_active(subject_id, token.into_upsert(now))
                    .await
                    .map_err(|e| Error::Credential(e.to_string()))?
                else {
                    warn!(subject_id, "credential deactivated during refresh, discarding new tokens");
                    record_refresh("revoked");
                    return Err(Error::Revoked(subject_id.to_owned()));
                };
                self.cache
                    .insert(subject_id, updated.access_token.clone(), updated.expires_at)
                    .await;
                record_refresh("success");
                info!(subject_id, expires_at = updated.expires_at, "token refresh succeeded");
                Ok(updated)
            }
            Err(meli_auth::Error::InvalidCredentials(msg)) => {
                warn!(subject_id, error = %msg, "refresh token rejected, deactivating credential");
                record_refresh("revoked");
                self.deactivate(subject_id).await?;
                Err(Error::Revoked(subject_id.to_owned()))
            }
            Err(e) => {
                warn!(subject_id, error = %e, "token refresh failed");
                record_refresh("error");
                Err(Error::RefreshFailed(e.to_string()))
            }
        }
    }
}

fn record_refresh(result: &'static str) {
    metrics::counter!("oauth_token_refresh_total", "result" => result).increment(1);
}
