//! Authorization initiator
//!
//! Starts one OAuth2 + PKCE attempt: fresh verifier and challenge, a signed
//! `state` capsule carrying the attempt, the server-side mirror of the
//! attempt, and the authorization URL to redirect the seller to. Setting
//! the mirror cookies is left to the HTTP layer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::attempts::AttemptStore;
use crate::clock::Clock;
use crate::constants::MAX_ATTEMPT_AGE;
use crate::error::{Error, Result};
use crate::pkce::{compute_challenge, generate_verifier};
use crate::state::{AuthorizationAttempt, StateCodec};

/// Static authorization endpoint settings.
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub authorization_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// Optional space-delimited scope; Mercado Livre grants the app's
    /// configured scopes when omitted.
    pub scope: Option<String>,
    pub max_age: Duration,
}

/// Everything the HTTP layer needs to send the seller off to authorize.
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub verifier: String,
    pub challenge: String,
    pub correlation_id: String,
    pub created_at: u64,
    pub max_age: Duration,
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("correlation_id", &self.correlation_id)
            .field("challenge", &self.challenge)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub struct Initiator {
    config: InitiatorConfig,
    endpoint: url::Url,
    codec: Arc<StateCodec>,
    attempts: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
}

impl Initiator {
    /// Fails with `Error::Configuration` on an empty client id or redirect
    /// URI, an unparsable authorization URL, or an attempt lifetime outside
    /// `1s..=15min`.
    pub fn new(
        config: InitiatorConfig,
        codec: Arc<StateCodec>,
        attempts: Arc<dyn AttemptStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            return Err(Error::Configuration("client_id must not be empty".into()));
        }
        if config.redirect_uri.trim().is_empty() {
            return Err(Error::Configuration(
                "redirect_uri must not be empty".into(),
            ));
        }
        if config.max_age.is_zero() || config.max_age > MAX_ATTEMPT_AGE {
            return Err(Error::Configuration(format!(
                "attempt lifetime must be between 1s and {}s",
                MAX_ATTEMPT_AGE.as_secs()
            )));
        }
        let endpoint = url::Url::parse(&config.authorization_url).map_err(|e| {
            Error::Configuration(format!("authorization_url is not a URL: {e}"))
        })?;

        Ok(Self {
            config,
            endpoint,
            codec,
            attempts,
            clock,
        })
    }

    pub fn max_age(&self) -> Duration {
        self.config.max_age
    }

    /// Create a new attempt and record it in the server-side mirror.
    pub async fn begin(&self) -> Result<AuthorizationRequest> {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        let attempt = AuthorizationAttempt::new(verifier, self.clock.now_millis());
        let state = self.codec.encode(&attempt)?;

        self.attempts
            .remember(&state, &attempt.verifier, self.config.max_age)
            .await;

        let url = self.authorization_url(&state, &challenge);
        info!(
            correlation_id = %attempt.correlation_id,
            "authorization attempt started"
        );

        Ok(AuthorizationRequest {
            url,
            state,
            verifier: attempt.verifier,
            challenge,
            correlation_id: attempt.correlation_id,
            created_at: attempt.created_at,
            max_age: self.config.max_age,
        })
    }

    fn authorization_url(&self, state: &str, challenge: &str) -> String {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", &self.config.redirect_uri)
                .append_pair("state", state)
                .append_pair("code_challenge", challenge)
                .append_pair("code_challenge_method", "S256");
            if let Some(scope) = self.config.scope.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("scope", scope);
            }
        }
        url.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::MemoryAttemptStore;
    use crate::clock::ManualClock;
    use crate::constants::AUTHORIZATION_ENDPOINT;
    use std::collections::HashMap;

    fn config() -> InitiatorConfig {
        InitiatorConfig {
            authorization_url: AUTHORIZATION_ENDPOINT.into(),
            client_id: "1234567890".into(),
            redirect_uri: "https://seller.example.com/oauth/callback".into(),
            scope: None,
            max_age: MAX_ATTEMPT_AGE,
        }
    }

    fn initiator(config: InitiatorConfig) -> Result<(Initiator, Arc<MemoryAttemptStore>)> {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let initiator = Initiator::new(
            config,
            Arc::new(StateCodec::new(b"k").unwrap()),
            attempts.clone(),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )?;
        Ok((initiator, attempts))
    }

    fn query(url: &str) -> HashMap<String, String> {
        url::Url::parse(url)
            .unwrap()
            .query_pairs()
            .into_owned()
            .collect()
    }

    #[tokio::test]
    async fn authorization_url_contains_required_params() {
        let (initiator, _) = initiator(config()).unwrap();
        let request = initiator.begin().await.unwrap();

        assert!(request.url.starts_with(AUTHORIZATION_ENDPOINT));
        let params = query(&request.url);
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "1234567890");
        assert_eq!(
            params["redirect_uri"],
            "https://seller.example.com/oauth/callback"
        );
        assert_eq!(params["state"], request.state);
        assert_eq!(params["code_challenge"], request.challenge);
        assert_eq!(params["code_challenge_method"], "S256");
        assert!(!params.contains_key("scope"));
        assert!(!params.contains_key("code_verifier"));
    }

    #[tokio::test]
    async fn challenge_derives_from_verifier() {
        let (initiator, _) = initiator(config()).unwrap();
        let request = initiator.begin().await.unwrap();
        assert_eq!(request.challenge, compute_challenge(&request.verifier));
        assert!(request.verifier.len() >= 43);
    }

    #[tokio::test]
    async fn state_embeds_the_verifier() {
        let (initiator, _) = initiator(config()).unwrap();
        let request = initiator.begin().await.unwrap();
        let attempt = StateCodec::new(b"k")
            .unwrap()
            .decode(&request.state)
            .unwrap();
        assert_eq!(attempt.verifier, request.verifier);
        assert_eq!(attempt.correlation_id, request.correlation_id);
        assert_eq!(attempt.created_at, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn attempt_is_mirrored_server_side() {
        let (initiator, attempts) = initiator(config()).unwrap();
        let request = initiator.begin().await.unwrap();
        assert_eq!(
            attempts.recover(&request.state).await,
            Some(request.verifier.clone())
        );
    }

    #[tokio::test]
    async fn scope_is_forwarded_when_configured() {
        let mut config = config();
        config.scope = Some("offline_access read write".into());
        let (initiator, _) = initiator(config).unwrap();
        let request = initiator.begin().await.unwrap();
        assert_eq!(query(&request.url)["scope"], "offline_access read write");
    }

    #[test]
    fn missing_configuration_fails_fast() {
        let mut bad = config();
        bad.client_id = String::new();
        assert!(matches!(initiator(bad), Err(Error::Configuration(_))));

        let mut bad = config();
        bad.redirect_uri = "  ".into();
        assert!(matches!(initiator(bad), Err(Error::Configuration(_))));

        let mut bad = config();
        bad.authorization_url = "not a url".into();
        assert!(matches!(initiator(bad), Err(Error::Configuration(_))));

        let mut bad = config();
        bad.max_age = Duration::from_secs(901);
        assert!(matches!(initiator(bad), Err(Error::Configuration(_))));
    }
}
