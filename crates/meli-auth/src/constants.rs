//! Mercado Livre OAuth constants
//!
//! Endpoint defaults for the Brazilian site and the fixed names used by the
//! secondary recovery channel. Client id, client secret and redirect URI are
//! deployment configuration and never appear here.

use std::time::Duration;

/// Authorization endpoint the seller's browser is redirected to
pub const AUTHORIZATION_ENDPOINT: &str = "https://auth.mercadolivre.com.br/authorization";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://api.mercadolibre.com/oauth/token";

/// Cookie mirroring the `state` value of the current attempt
pub const STATE_COOKIE: &str = "meli_oauth_state";

/// Cookie mirroring the PKCE verifier of the current attempt
pub const VERIFIER_COOKIE: &str = "meli_code_verifier";

/// Upper bound on the lifetime of an authorization attempt.
/// Also the cookie `Max-Age` ceiling.
pub const MAX_ATTEMPT_AGE: Duration = Duration::from_secs(15 * 60);

/// Default timeout for calls to the token endpoint
pub const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Access token lifetime assumed when the token endpoint omits `expires_in`
/// (Mercado Livre issues six-hour tokens).
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 6 * 60 * 60;

/// Random bytes behind each PKCE verifier. 64 bytes encode to 86
/// base64url characters, inside RFC 7636's 43..=128 range.
pub const VERIFIER_BYTES: usize = 64;

/// Tries per refresh before giving up on a transport failure
pub const REFRESH_MAX_ATTEMPTS: u32 = 3;

/// Fixed pause between refresh tries
pub const REFRESH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Access tokens this close to expiry are refreshed before use
pub const REFRESH_SKEW: Duration = Duration::from_secs(60);
