//! Token lifecycle for Mercado Livre seller credentials
//!
//! Keeps access tokens usable after the initial exchange: an injected TTL
//! cache in front of the credential store, inline renewal when a token is
//! about to expire, a background task that refreshes ahead of time, and
//! deactivation when Mercado Livre rejects a token or refresh token.
//!
//! Credential lifecycle:
//! 1. Callback exchange upserts the credential, `is_active = true`
//! 2. `TokenProvider::access_token()` serves from cache or store
//! 3. Token expiring within the skew window → inline refresh, upsert, cache
//! 4. Refresh rejected (401/403/invalid_grant) → credential deactivated
//! 5. Upstream rejects a token on use → `report_unauthorized()` deactivates
//! 6. Background task refreshes tokens proactively before expiration

pub mod cache;
pub mod error;
pub mod provider;
pub mod refresh;

pub use cache::TokenCache;
pub use error::{Error, Result};
pub use provider::TokenProvider;
pub use refresh::{CycleSummary, refresh_cycle, spawn_refresh_task};
