//! Self-contained `state` capsule
//!
//! The `state` parameter is the primary recovery channel for the PKCE
//! verifier. It carries the whole authorization attempt so the callback can
//! be served by any instance, even when the browser drops cookies on the
//! cross-site redirect back from Mercado Livre.
//!
//! Wire format: `base64url(json) "." base64url(hmac_sha256(key, base64url(json)))`.
//! A capsule whose MAC does not verify is indistinguishable from garbage and
//! decodes to `Error::InvalidState`.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::pkce::is_valid_verifier;

type HmacSha256 = Hmac<Sha256>;

/// One authorization attempt, alive between initiation and callback.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationAttempt {
    pub correlation_id: String,
    pub verifier: String,
    /// Unix milliseconds
    pub created_at: u64,
}

impl AuthorizationAttempt {
    /// New attempt with a fresh random correlation id.
    pub fn new(verifier: String, created_at: u64) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            verifier,
            created_at,
        }
    }

    /// Age at `now_millis`. A timestamp in the future counts as age zero.
    pub fn age(&self, now_millis: u64) -> Duration {
        Duration::from_millis(now_millis.saturating_sub(self.created_at))
    }

    pub fn is_expired(&self, now_millis: u64, max_age: Duration) -> bool {
        self.age(now_millis) > max_age
    }
}

impl fmt::Debug for AuthorizationAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationAttempt")
            .field("correlation_id", &self.correlation_id)
            .field("verifier", &"[REDACTED]")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Encodes and verifies `state` capsules with an HMAC key shared by every
/// gateway instance.
pub struct StateCodec {
    key: Secret<Vec<u8>>,
}

impl StateCodec {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::Configuration(
                "state signing key must not be empty".into(),
            ));
        }
        Ok(Self {
            key: Secret::new(key.to_vec()),
        })
    }

    pub fn encode(&self, attempt: &AuthorizationAttempt) -> Result<String> {
        let json = serde_json::to_vec(attempt)
            .map_err(|e| Error::InvalidState(format!("serializing attempt: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = URL_SAFE_NO_PAD.encode(self.mac(&payload)?.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Verify and decode a capsule. Does not check expiry; that belongs to
    /// the attempt, not the channel.
    pub fn decode(&self, state: &str) -> Result<AuthorizationAttempt> {
        let (payload, signature) = state
            .split_once('.')
            .ok_or_else(|| Error::InvalidState("missing signature separator".into()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| Error::InvalidState(format!("signature is not base64url: {e}")))?;
        self.mac(payload)?
            .verify_slice(&signature)
            .map_err(|_| Error::InvalidState("signature mismatch".into()))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| Error::InvalidState(format!("payload is not base64url: {e}")))?;
        let attempt: AuthorizationAttempt = serde_json::from_slice(&json)
            .map_err(|e| Error::InvalidState(format!("payload is not an attempt: {e}")))?;

        if !is_valid_verifier(&attempt.verifier) {
            return Err(Error::InvalidState("embedded verifier is malformed".into()));
        }
        Ok(attempt)
    }

    fn mac(&self, payload: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.key.expose())
            .map_err(|e| Error::Configuration(format!("state signing key: {e}")))?;
        mac.update(payload.as_bytes());
        Ok(mac)
    }
}

impl fmt::Debug for StateCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCodec").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::pkce::generate_verifier;

    fn codec() -> StateCodec {
        StateCodec::new(b"test-state-key").unwrap()
    }

    #[test]
    fn decode_right_after_encode_recovers_attempt() {
        let codec = codec();
        let before = SystemClock.now_millis();
        let verifier = generate_verifier();
        let attempt = AuthorizationAttempt::new(verifier.clone(), SystemClock.now_millis());

        let state = codec.encode(&attempt).unwrap();
        let decoded = codec.decode(&state).unwrap();

        assert_eq!(decoded.verifier, verifier);
        assert_eq!(decoded.correlation_id, attempt.correlation_id);
        assert!(decoded.created_at.abs_diff(before) <= 1_000);
    }

    #[test]
    fn state_is_url_safe() {
        let attempt = AuthorizationAttempt::new(generate_verifier(), 1_700_000_000_000);
        let state = codec().encode(&attempt).unwrap();
        assert!(
            state
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'),
            "state must survive a query string untouched: {state}"
        );
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = AuthorizationAttempt::new(generate_verifier(), 0);
        let b = AuthorizationAttempt::new(generate_verifier(), 0);
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let codec = codec();
        let attempt = AuthorizationAttempt::new(generate_verifier(), 1_700_000_000_000);
        let state = codec.encode(&attempt).unwrap();
        let (_, signature) = state.split_once('.').unwrap();

        let mut forged = attempt.clone();
        forged.created_at = u64::MAX / 2;
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());

        let result = codec.decode(&format!("{forged_payload}.{signature}"));
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[test]
    fn other_key_cannot_decode() {
        let attempt = AuthorizationAttempt::new(generate_verifier(), 1_700_000_000_000);
        let state = codec().encode(&attempt).unwrap();
        let other = StateCodec::new(b"another-instance-key").unwrap();
        assert!(other.decode(&state).is_err());
    }

    #[test]
    fn garbage_is_rejected_without_panicking() {
        let codec = codec();
        for input in ["", ".", "abc", "abc.def", "!!!.???", "a.b.c", "%%%"] {
            assert!(codec.decode(input).is_err(), "accepted garbage: {input:?}");
        }
    }

    #[test]
    fn expiry_is_inclusive_of_max_age() {
        let attempt = AuthorizationAttempt::new(generate_verifier(), 1_000);
        let max_age = Duration::from_secs(900);
        assert!(!attempt.is_expired(1_000 + 900_000, max_age));
        assert!(attempt.is_expired(1_000 + 900_001, max_age));
        // clock skew: created in the future is not expired
        assert!(!attempt.is_expired(0, max_age));
    }

    #[test]
    fn empty_key_is_a_configuration_error() {
        assert!(matches!(StateCodec::new(b""), Err(Error::Configuration(_))));
    }

    #[test]
    fn debug_never_shows_verifier() {
        let attempt = AuthorizationAttempt::new("v".repeat(43), 0);
        let debug = format!("{attempt:?} {:?}", codec());
        assert!(!debug.contains(&"v".repeat(43)));
        assert!(!debug.contains("test-state-key"));
    }
}
