//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the OAuth
//! authorization flow. The verifier travels inside the signed `state`
//! capsule and is sent back during token exchange; the challenge goes to
//! the authorization server in the authorization URL and is never returned.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::VERIFIER_BYTES;

/// Generate a cryptographically random PKCE code verifier.
///
/// Draws from the OS-seeded thread RNG. If the OS entropy source is
/// unavailable the RNG panics; there is no fallback to a weaker source.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`, no padding.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Whether `verifier` satisfies RFC 7636 section 4.1: 43..=128 characters
/// from `[A-Z] / [a-z] / [0-9] / "-" / "." / "_" / "~"`.
///
/// Verifiers recovered from cookies are checked with this before use.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}
