//! Callback exchanger
//!
//! Drives one `/oauth/callback` request to a terminal outcome:
//!
//! ```text
//! START ── error param ───────────────────────────────► RemoteDenied
//!   │ ─── no code ────────────────────────────────────► MissingCode
//!   │ ─── no state ───────────────────────────────────► MissingState
//!   ▼
//! decode state ── ok, expired ────────────────────────► StateExpired
//!   │ ok, fresh                │ decode failure
//!   │                          ▼
//!   │                 cookie pair / server cache ─ none ► VerifierNotFound
//!   ▼                          │
//! consume attempt ◄────────────┘ ── already consumed ─► ReplayDetected
//!   ▼
//! token endpoint ── non-2xx / malformed ──────────────► ExchangeRejected
//!   │            ── timeout ──────────────────────────► NetworkTimeout
//!   ▼
//! upsert credential ── store failure ─────────────────► PersistFailed
//!   ▼
//! Succeeded
//! ```
//!
//! An expired primary capsule never falls back to the secondary channel:
//! expiry belongs to the attempt, not to the channel that carried it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::attempts::AttemptStore;
use crate::clock::Clock;
use crate::credentials::{Credential, CredentialStore};
use crate::error::Error;
use crate::pkce::is_valid_verifier;
use crate::state::StateCodec;
use crate::token::TokenClient;

/// Query parameters of the callback request.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Secondary-channel values presented by the browser (mirror cookies).
#[derive(Default, Clone)]
pub struct SecondaryChannel {
    pub state: Option<String>,
    pub verifier: Option<String>,
}

impl fmt::Debug for SecondaryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryChannel")
            .field("state", &self.state.is_some())
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

/// Which channel yielded the verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChannel {
    State,
    Cookie,
    ServerCache,
}

impl RecoveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryChannel::State => "state",
            RecoveryChannel::Cookie => "cookie",
            RecoveryChannel::ServerCache => "server_cache",
        }
    }
}

/// Successful callback.
#[derive(Debug)]
pub struct ExchangeOutcome {
    pub credential: Credential,
    pub recovered_via: RecoveryChannel,
}

/// Terminal failure of a callback. Every variant is reported to the
/// browser as JSON; none of them carries secrets or token material.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("authorization was denied: {error}")]
    RemoteDenied {
        error: String,
        description: Option<String>,
    },

    #[error("callback is missing the authorization code")]
    MissingCode,

    #[error("callback is missing the state parameter")]
    MissingState,

    #[error("authorization attempt expired after {age_secs}s (limit {max_age_secs}s), start the login again")]
    StateExpired { age_secs: u64, max_age_secs: u64 },

    #[error("no code verifier could be recovered for this state, start the login again")]
    VerifierNotFound,

    #[error("this authorization attempt was already used")]
    ReplayDetected,

    #[error("token endpoint rejected the code exchange ({status}: {})", .code.as_deref().unwrap_or("unknown_error"))]
    ExchangeRejected {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    #[error("token endpoint timed out, start the login again")]
    NetworkTimeout,

    #[error("token endpoint unreachable: {0}")]
    Network(String),

    #[error("failed to persist credential: {0}")]
    PersistFailed(String),
}

impl CallbackError {
    /// Stage of the flow that failed.
    pub fn step(&self) -> &'static str {
        match self {
            CallbackError::RemoteDenied { .. } => "authorize",
            CallbackError::MissingCode | CallbackError::MissingState => "callback",
            CallbackError::StateExpired { .. }
            | CallbackError::VerifierNotFound
            | CallbackError::ReplayDetected => "state",
            CallbackError::ExchangeRejected { .. }
            | CallbackError::NetworkTimeout
            | CallbackError::Network(_) => "exchange",
            CallbackError::PersistFailed(_) => "persist",
        }
    }

    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            CallbackError::RemoteDenied { .. } => "remote_denied",
            CallbackError::MissingCode => "missing_code",
            CallbackError::MissingState => "missing_state",
            CallbackError::StateExpired { .. } => "state_expired",
            CallbackError::VerifierNotFound => "verifier_not_found",
            CallbackError::ReplayDetected => "replay",
            CallbackError::ExchangeRejected { .. } => "exchange_rejected",
            CallbackError::NetworkTimeout => "network_timeout",
            CallbackError::Network(_) => "network_error",
            CallbackError::PersistFailed(_) => "persist_failed",
        }
    }

    /// HTTP status the gateway answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            CallbackError::RemoteDenied { .. }
            | CallbackError::MissingCode
            | CallbackError::MissingState
            | CallbackError::StateExpired { .. }
            | CallbackError::VerifierNotFound => 400,
            CallbackError::ReplayDetected => 409,
            CallbackError::ExchangeRejected { .. } | CallbackError::Network(_) => 502,
            CallbackError::NetworkTimeout => 504,
            CallbackError::PersistFailed(_) => 500,
        }
    }

    /// Whether the seller can simply retry the login.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallbackError::NetworkTimeout | CallbackError::Network(_)
        )
    }
}

fn exchange_failure(err: Error) -> CallbackError {
    match err {
        Error::Timeout(_) => CallbackError::NetworkTimeout,
        Error::Http(msg) => CallbackError::Network(msg),
        Error::Rejected {
            status,
            code,
            message,
        } => CallbackError::ExchangeRejected {
            status,
            code,
            message,
        },
        Error::MalformedResponse { status, .. } => CallbackError::ExchangeRejected {
            status,
            code: Some("malformed_response".into()),
            message: None,
        },
        other => CallbackError::ExchangeRejected {
            status: 0,
            code: None,
            message: Some(other.to_string()),
        },
    }
}

pub struct Exchanger {
    client: Arc<TokenClient>,
    codec: Arc<StateCodec>,
    attempts: Arc<dyn AttemptStore>,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    max_age: Duration,
}

impl Exchanger {
    pub fn new(
        client: Arc<TokenClient>,
        codec: Arc<StateCodec>,
        attempts: Arc<dyn AttemptStore>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        max_age: Duration,
    ) -> Self {
        Self {
            client,
            codec,
            attempts,
            credentials,
            clock,
            max_age,
        }
    }

    /// Run a callback to its terminal outcome.
    ///
    /// Whatever the outcome, the server-side mirror for the presented state
    /// is dropped; the caller clears the mirror cookies.
    pub async fn complete(
        &self,
        params: &CallbackParams,
        secondary: &SecondaryChannel,
    ) -> Result<ExchangeOutcome, CallbackError> {
        let result = self.run(params, secondary).await;

        if let Some(state) = params.state.as_deref().filter(|s| !s.is_empty()) {
            self.attempts.forget(state).await;
        }

        match &result {
            Ok(outcome) => info!(
                subject_id = %outcome.credential.subject_id,
                recovered_via = outcome.recovered_via.as_str(),
                "OAuth callback completed"
            ),
            Err(e) => warn!(
                step = e.step(),
                reason = e.reason(),
                error = %e,
                "OAuth callback failed"
            ),
        }
        result
    }

    async fn run(
        &self,
        params: &CallbackParams,
        secondary: &SecondaryChannel,
    ) -> Result<ExchangeOutcome, CallbackError> {
        if let Some(error) = params.error.as_deref() {
            return Err(CallbackError::RemoteDenied {
                error: error.to_owned(),
                description: params.error_description.clone(),
            });
        }
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(CallbackError::MissingCode)?;
        let state = params
            .state
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(CallbackError::MissingState)?;

        let (verifier, consume_key, recovered_via) = self.recover_verifier(state, secondary).await?;

        if !self.attempts.consume(&consume_key, self.max_age).await {
            return Err(CallbackError::ReplayDetected);
        }

        let now = self.clock.now_millis();
        let token = self
            .client
            .exchange_code(code, &verifier)
            .await
            .map_err(exchange_failure)?;

        let subject_id = token.user_id.clone();
        let credential = self
            .credentials
            .upsert(&subject_id, token.into_upsert(now))
            .await
            .map_err(|e| CallbackError::PersistFailed(e.to_string()))?;

        Ok(ExchangeOutcome {
            credential,
            recovered_via,
        })
    }

    /// Returns the verifier, the single-use key for the attempt, and the
    /// channel it came from.
    async fn recover_verifier(
        &self,
        state: &str,
        secondary: &SecondaryChannel,
    ) -> Result<(String, String, RecoveryChannel), CallbackError> {
        match self.codec.decode(state) {
            Ok(attempt) => {
                let now = self.clock.now_millis();
                if attempt.is_expired(now, self.max_age) {
                    return Err(CallbackError::StateExpired {
                        age_secs: attempt.age(now).as_secs(),
                        max_age_secs: self.max_age.as_secs(),
                    });
                }
                Ok((
                    attempt.verifier,
                    attempt.correlation_id,
                    RecoveryChannel::State,
                ))
            }
            Err(e) => {
                warn!(error = %e, "state capsule undecodable, trying secondary channel");

                let cookie_verifier = secondary
                    .verifier
                    .as_deref()
                    .filter(|_| secondary.state.as_deref() == Some(state))
                    .filter(|v| is_valid_verifier(v));
                if let Some(verifier) = cookie_verifier {
                    return Ok((verifier.to_owned(), state.to_owned(), RecoveryChannel::Cookie));
                }

                match self.attempts.recover(state).await {
                    Some(verifier) => Ok((verifier, state.to_owned(), RecoveryChannel::ServerCache)),
                    None => Err(CallbackError::VerifierNotFound),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::attempts::MemoryAttemptStore;
    use crate::clock::ManualClock;
    use crate::constants::{AUTHORIZATION_ENDPOINT, MAX_ATTEMPT_AGE};
    use crate::credentials::MemoryCredentialStore;
    use crate::initiator::{Initiator, InitiatorConfig};
    use crate::pkce::generate_verifier;
    use crate::state::AuthorizationAttempt;
    use crate::token::tests::{MockTokenServer, client_for, start_token_server};

    const T0: u64 = 1_700_000_000_000;

    struct Harness {
        initiator: Initiator,
        exchanger: Exchanger,
        credentials: Arc<MemoryCredentialStore>,
        attempts: Arc<MemoryAttemptStore>,
        codec: Arc<StateCodec>,
        clock: Arc<ManualClock>,
        server: MockTokenServer,
    }

    async fn harness(status: u16, body: serde_json::Value) -> Harness {
        let server = start_token_server(status, body).await;
        let codec = Arc::new(StateCodec::new(b"callback-test-key").unwrap());
        let attempts = Arc::new(MemoryAttemptStore::new());
        let credentials = Arc::new(MemoryCredentialStore::new());
        let clock = Arc::new(ManualClock::new(T0));

        let initiator = Initiator::new(
            InitiatorConfig {
                authorization_url: AUTHORIZATION_ENDPOINT.into(),
                client_id: "1234567890".into(),
                redirect_uri: "https://seller.example.com/oauth/callback".into(),
                scope: None,
                max_age: MAX_ATTEMPT_AGE,
            },
            codec.clone(),
            attempts.clone(),
            clock.clone(),
        )
        .unwrap();
        let exchanger = Exchanger::new(
            Arc::new(client_for(&server.url)),
            codec.clone(),
            attempts.clone(),
            credentials.clone(),
            clock.clone(),
            MAX_ATTEMPT_AGE,
        );

        Harness {
            initiator,
            exchanger,
            credentials,
            attempts,
            codec,
            clock,
            server,
        }
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({"access_token":"A","refresh_token":"B","user_id":"U1","scope":"read"})
    }

    fn callback(code: &str, state: &str) -> CallbackParams {
        CallbackParams {
            code: Some(code.into()),
            state: Some(state.into()),
            ..Default::default()
        }
    }

    fn calls(h: &Harness) -> usize {
        h.server.calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn valid_callback_upserts_exactly_once() {
        let h = harness(200, ok_body()).await;
        let request = h.initiator.begin().await.unwrap();

        let outcome = h
            .exchanger
            .complete(&callback("abc123", &request.state), &SecondaryChannel::default())
            .await
            .unwrap();

        assert_eq!(outcome.recovered_via, RecoveryChannel::State);
        assert_eq!(outcome.credential.subject_id, "U1");
        assert_eq!(outcome.credential.access_token, "A");
        assert_eq!(outcome.credential.scope, "read");
        assert_eq!(calls(&h), 1);

        let stored = h.credentials.get("U1").await.unwrap();
        assert_eq!(stored.access_token, "A");
        assert_eq!(stored.refresh_token.as_deref(), Some("B"));
        assert_eq!(h.credentials.subject_ids().await.len(), 1);

        let form = &h.server.forms.lock().unwrap()[0];
        assert_eq!(form["code"], "abc123");
        assert_eq!(form["code_verifier"], request.verifier);
    }

    #[tokio::test]
    async fn remote_denial_never_calls_token_endpoint() {
        let h = harness(200, ok_body()).await;
        let params = CallbackParams {
            error: Some("access_denied".into()),
            error_description: Some("user declined".into()),
            ..Default::default()
        };

        let err = h
            .exchanger
            .complete(&params, &SecondaryChannel::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::RemoteDenied { .. }));
        assert_eq!(err.step(), "authorize");
        assert_eq!(calls(&h), 0);
    }

    #[tokio::test]
    async fn missing_code_or_state_is_malformed() {
        let h = harness(200, ok_body()).await;
        let request = h.initiator.begin().await.unwrap();

        let no_code = CallbackParams {
            state: Some(request.state.clone()),
            ..Default::default()
        };
        let err = h
            .exchanger
            .complete(&no_code, &SecondaryChannel::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::MissingCode));

        let no_state = CallbackParams {
            code: Some("abc123".into()),
            ..Default::default()
        };
        let err = h
            .exchanger
            .complete(&no_state, &SecondaryChannel::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::MissingState));
        assert_eq!(err.http_status(), 400);
        assert_eq!(calls(&h), 0);
    }

    #[tokio::test]
    async fn expired_state_is_rejected_without_fallback() {
        let h = harness(200, ok_body()).await;
        let request = h.initiator.begin().await.unwrap();
        h.clock.set(request.created_at + MAX_ATTEMPT_AGE.as_millis() as u64 + 1);

        // A matching cookie pair must not rescue an expired capsule.
        let cookies = SecondaryChannel {
            state: Some(request.state.clone()),
            verifier: Some(request.verifier.clone()),
        };
        let err = h
            .exchanger
            .complete(&callback("abc123", &request.state), &cookies)
            .await
            .unwrap_err();

        assert!(matches!(err, CallbackError::StateExpired { .. }), "got {err:?}");
        assert_eq!(calls(&h), 0);
        assert!(h.credentials.get("U1").await.is_none());
    }

    #[tokio::test]
    async fn state_at_exact_max_age_is_still_valid() {
        let h = harness(200, ok_body()).await;
        let request = h.initiator.begin().await.unwrap();
        h.clock.set(request.created_at + MAX_ATTEMPT_AGE.as_millis() as u64);

        let result = h
            .exchanger
            .complete(&callback("abc123", &request.state), &SecondaryChannel::default())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn replayed_state_is_detected() {
        let h = harness(200, ok_body()).await;
        let request = h.initiator.begin().await.unwrap();
        let params = callback("abc123", &request.state);

        h.exchanger
            .complete(&params, &SecondaryChannel::default())
            .await
            .unwrap();
        let err = h
            .exchanger
            .complete(&params, &SecondaryChannel::default())
            .await
            .unwrap_err();

        assert!(matches!(err, CallbackError::ReplayDetected));
        assert_eq!(err.http_status(), 409);
        assert_eq!(calls(&h), 1, "replay must not reach the token endpoint");
        assert_eq!(h.credentials.get("U1").await.unwrap().access_token, "A");
    }

    #[tokio::test]
    async fn undecodable_state_without_secondary_is_verifier_not_found() {
        let h = harness(200, ok_body()).await;
        let err = h
            .exchanger
            .complete(&callback("abc123", "not-a-capsule"), &SecondaryChannel::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::VerifierNotFound));
        assert_eq!(calls(&h), 0);
    }

    #[tokio::test]
    async fn cookie_pair_recovers_verifier_for_opaque_state() {
        let h = harness(200, ok_body()).await;
        let verifier = generate_verifier();
        let cookies = SecondaryChannel {
            state: Some("opaque-state".into()),
            verifier: Some(verifier.clone()),
        };

        let outcome = h
            .exchanger
            .complete(&callback("abc123", "opaque-state"), &cookies)
            .await
            .unwrap();
        assert_eq!(outcome.recovered_via, RecoveryChannel::Cookie);
        assert_eq!(h.server.forms.lock().unwrap()[0]["code_verifier"], verifier);
    }

    #[tokio::test]
    async fn cookie_for_a_different_state_is_ignored() {
        let h = harness(200, ok_body()).await;
        let cookies = SecondaryChannel {
            state: Some("other-state".into()),
            verifier: Some(generate_verifier()),
        };
        let err = h
            .exchanger
            .complete(&callback("abc123", "opaque-state"), &cookies)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::VerifierNotFound));
    }

    #[tokio::test]
    async fn server_cache_recovers_verifier_when_capsule_is_mangled() {
        let h = harness(200, ok_body()).await;
        let verifier = generate_verifier();
        h.attempts
            .remember("mangled-state", &verifier, MAX_ATTEMPT_AGE)
            .await;

        let outcome = h
            .exchanger
            .complete(&callback("abc123", "mangled-state"), &SecondaryChannel::default())
            .await
            .unwrap();
        assert_eq!(outcome.recovered_via, RecoveryChannel::ServerCache);
        assert_eq!(h.attempts.recover("mangled-state").await, None);
    }

    #[tokio::test]
    async fn capsule_signed_with_another_key_falls_back() {
        let h = harness(200, ok_body()).await;
        let foreign = StateCodec::new(b"someone-else").unwrap();
        let attempt = AuthorizationAttempt::new(generate_verifier(), T0);
        let forged = foreign.encode(&attempt).unwrap();
        assert!(h.codec.decode(&forged).is_err());

        let err = h
            .exchanger
            .complete(&callback("abc123", &forged), &SecondaryChannel::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::VerifierNotFound));
    }

    #[tokio::test]
    async fn rejected_exchange_surfaces_remote_status() {
        let h = harness(
            400,
            serde_json::json!({"error":"invalid_grant","message":"code expired"}),
        )
        .await;
        let request = h.initiator.begin().await.unwrap();

        let err = h
            .exchanger
            .complete(&callback("abc123", &request.state), &SecondaryChannel::default())
            .await
            .unwrap_err();
        match &err {
            CallbackError::ExchangeRejected { status, code, .. } => {
                assert_eq!(*status, 400);
                assert_eq!(code.as_deref(), Some("invalid_grant"));
            }
            other => panic!("expected ExchangeRejected, got {other:?}"),
        }
        assert_eq!(err.step(), "exchange");
        assert!(!err.to_string().contains("shh-client-secret"));
        assert!(h.credentials.get("U1").await.is_none());
    }

    #[tokio::test]
    async fn pending_mirror_is_dropped_on_any_outcome() {
        let h = harness(400, serde_json::json!({"error":"invalid_grant"})).await;
        let request = h.initiator.begin().await.unwrap();
        assert!(h.attempts.recover(&request.state).await.is_some());

        let _ = h
            .exchanger
            .complete(&callback("abc123", &request.state), &SecondaryChannel::default())
            .await;
        assert_eq!(h.attempts.recover(&request.state).await, None);
    }

    #[test]
    fn error_classification_is_stable() {
        let cases: Vec<(CallbackError, &str, &str, u16)> = vec![
            (
                CallbackError::RemoteDenied {
                    error: "access_denied".into(),
                    description: None,
                },
                "authorize",
                "remote_denied",
                400,
            ),
            (CallbackError::MissingCode, "callback", "missing_code", 400),
            (
                CallbackError::StateExpired {
                    age_secs: 901,
                    max_age_secs: 900,
                },
                "state",
                "state_expired",
                400,
            ),
            (CallbackError::ReplayDetected, "state", "replay", 409),
            (CallbackError::NetworkTimeout, "exchange", "network_timeout", 504),
            (
                CallbackError::PersistFailed("disk full".into()),
                "persist",
                "persist_failed",
                500,
            ),
        ];
        for (err, step, reason, status) in cases {
            assert_eq!(err.step(), step);
            assert_eq!(err.reason(), reason);
            assert_eq!(err.http_status(), status);
        }
        assert!(CallbackError::NetworkTimeout.is_retryable());
        assert!(!CallbackError::ReplayDetected.is_retryable());
    }

    #[test]
    fn timeout_maps_to_network_timeout() {
        assert!(matches!(
            exchange_failure(Error::Timeout("10s".into())),
            CallbackError::NetworkTimeout
        ));
        assert!(matches!(
            exchange_failure(Error::MalformedResponse {
                status: 200,
                detail: "missing field".into()
            }),
            CallbackError::ExchangeRejected { status: 200, .. }
        ));
    }
}
