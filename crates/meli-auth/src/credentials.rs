//! Credential storage for Mercado Livre OAuth tokens
//!
//! One credential per subject (the marketplace user id). Writes are upserts
//! keyed by subject: an exchange for a seller who already has a credential
//! overwrites it, last writer wins. Revocation is a soft delete through
//! `is_active`.
//!
//! `FileCredentialStore` keeps a JSON file in sync with an in-memory map.
//! All writes use atomic temp-file + rename to prevent corruption on crash,
//! and a tokio Mutex serializes concurrent writers (callback exchanges,
//! background refresh, revocations). The map only changes once the file
//! write has succeeded.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::attempts::BoxFuture;
use crate::error::{Error, Result};

/// Durable token material for one subject.
///
/// Timestamps are unix milliseconds.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub subject_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space-delimited granted permissions
    #[serde(default)]
    pub scope: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub is_active: bool,
}

impl Credential {
    /// Whether the access token expires within `window` of `now_millis`
    /// (or already has).
    pub fn expires_within(&self, now_millis: u64, window: Duration) -> bool {
        self.expires_at <= now_millis.saturating_add(window.as_millis() as u64)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject_id", &self.subject_id)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Fields written by an exchange or a refresh.
#[derive(Clone)]
pub struct CredentialUpsert {
    pub access_token: String,
    /// `None` keeps the refresh token already on file.
    pub refresh_token: Option<String>,
    pub scope: String,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl fmt::Debug for CredentialUpsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialUpsert")
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Apply an upsert on top of whatever is stored for `subject_id`.
fn merge(existing: Option<&Credential>, subject_id: &str, update: CredentialUpsert) -> Credential {
    let refresh_token = update
        .refresh_token
        .or_else(|| existing.and_then(|c| c.refresh_token.clone()));
    let scope = if update.scope.is_empty() {
        existing.map(|c| c.scope.clone()).unwrap_or_default()
    } else {
        update.scope
    };
    Credential {
        subject_id: subject_id.to_owned(),
        access_token: update.access_token,
        refresh_token,
        scope,
        issued_at: update.issued_at,
        expires_at: update.expires_at,
        is_active: true,
    }
}

/// Durable subject -> credential mapping.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Create or overwrite the credential for `subject_id` and mark it active.
    fn upsert<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Credential>>;

    /// Apply a refresh on top of an active credential. Returns `None` and
    /// writes nothing when the subject is unknown or was deactivated, so a
    /// refresh never reactivates a revoked credential.
    fn update_active<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Option<Credential>>>;

    /// Current credential, active or not. `None` means not found.
    fn get<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Option<Credential>>;

    /// Soft-delete. Returns whether a credential existed.
    fn deactivate<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// All stored subjects.
    fn subject_ids(&self) -> BoxFuture<'_, Vec<String>>;
}

/// JSON-file backed credential store.
///
/// The Mutex serializes all writes. Reads acquire the lock briefly to clone
/// the in-memory state.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, Credential>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with no
    /// sellers logged in).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credentials: HashMap<String, Credential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), subjects = credentials.len(), "loaded credentials");
            credentials
        } else {
            info!(path = %path.display(), "credential file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Number of stored credentials, active or not.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl FileCredentialStore {
    /// Persist `next` and only then make it the served state.
    async fn commit(
        &self,
        state: &mut HashMap<String, Credential>,
        next: HashMap<String, Credential>,
    ) -> Result<()> {
        write_atomic(&self.path, &next).await?;
        *state = next;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn upsert<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let credential = merge(state.get(subject_id), subject_id, update);
            let mut next = state.clone();
            next.insert(subject_id.to_owned(), credential.clone());
            self.commit(&mut state, next).await?;
            debug!(subject_id, "upserted credential");
            Ok(credential)
        })
    }

    fn update_active<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(existing) = state.get(subject_id).filter(|c| c.is_active) else {
                return Ok(None);
            };
            let credential = merge(Some(existing), subject_id, update);
            let mut next = state.clone();
            next.insert(subject_id.to_owned(), credential.clone());
            self.commit(&mut state, next).await?;
            debug!(subject_id, "refreshed credential");
            Ok(Some(credential))
        })
    }

    fn get<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Option<Credential>> {
        Box::pin(async move { self.state.lock().await.get(subject_id).cloned() })
    }

    fn deactivate<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.contains_key(subject_id) {
                return Ok(false);
            }
            let mut next = state.clone();
            if let Some(credential) = next.get_mut(subject_id) {
                credential.is_active = false;
            }
            self.commit(&mut state, next).await?;
            debug!(subject_id, "deactivated credential");
            Ok(true)
        })
    }

    fn subject_ids(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { self.state.lock().await.keys().cloned().collect() })
    }
}

/// In-process credential store for tests and throwaway deployments.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<HashMap<String, Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn upsert<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Credential>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let credential = merge(state.get(subject_id), subject_id, update);
            state.insert(subject_id.to_owned(), credential.clone());
            Ok(credential)
        })
    }

    fn update_active<'a>(
        &'a self,
        subject_id: &'a str,
        update: CredentialUpsert,
    ) -> BoxFuture<'a, Result<Option<Credential>>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(existing) = state.get(subject_id).filter(|c| c.is_active) else {
                return Ok(None);
            };
            let credential = merge(Some(existing), subject_id, update);
            state.insert(subject_id.to_owned(), credential.clone());
            Ok(Some(credential))
        })
    }

    fn get<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Option<Credential>> {
        Box::pin(async move { self.state.lock().await.get(subject_id).cloned() })
    }

    fn deactivate<'a>(&'a self, subject_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(match state.get_mut(subject_id) {
                Some(credential) => {
                    credential.is_active = false;
                    true
                }
                None => false,
            })
        })
    }

    fn subject_ids(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { self.state.lock().await.keys().cloned().collect() })
    }
}

/// Write credentials to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains OAuth tokens.
async fn write_atomic(path: &Path, data: &HashMap<String, Credential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}
