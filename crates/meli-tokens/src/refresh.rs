//! Proactive background token refresh
//!
//! Spawns a periodic task that walks every active credential and refreshes
//! tokens approaching expiration, so request-time renewal in
//! [`TokenProvider::access_token`] is the exception.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::provider::TokenProvider;

/// Spawn a background task that proactively refreshes expiring tokens.
///
/// Runs every `interval` and refreshes any active credential expiring
/// within `threshold`. A rejected refresh token deactivates the credential;
/// transient failures are retried on the next cycle.
pub fn spawn_refresh_task(
    provider: Arc<TokenProvider>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, credentials were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&provider, threshold).await;
        }
    })
}

/// Outcome counts of one refresh cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub refreshed: usize,
    pub failed: usize,
}

/// Run one refresh cycle over all stored subjects.
pub async fn refresh_cycle(provider: &TokenProvider, threshold: Duration) -> CycleSummary {
    let mut summary = CycleSummary::default();

    for id in provider.credential_store().subject_ids().await {
        match provider.refresh_if_expiring(&id, threshold).await {
            Ok(Some(_)) => summary.refreshed += 1,
            Ok(None) => {}
            // Removed since the listing
            Err(Error::NotFound(_)) => {}
            // Already inactive, or deactivated just now by a rejected refresh
            Err(Error::Revoked(_)) => {
                debug!(subject_id = %id, "skipping inactive credential");
            }
            Err(e) => {
                warn!(subject_id = %id, error = %e, "background refresh failed, will retry next cycle");
                summary.failed += 1;
            }
        }
    }

    if summary != CycleSummary::default() {
        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            "background refresh cycle finished"
        );
    }
    summary
}
