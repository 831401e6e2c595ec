//! OAuth token endpoint client
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (callback completion). Never retried: the
//!    marketplace accepts each code once.
//! 2. Token refresh (lazy and background renewal). Idempotent, so transport
//!    failures are retried with a fixed backoff.
//!
//! Both POST form-encoded bodies to the token endpoint. Error values carry
//! the remote status and error code but never the client secret, the
//! submitted code/verifier, or token material.

use std::fmt;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::constants::DEFAULT_EXPIRES_IN_SECS;
use crate::credentials::CredentialUpsert;
use crate::error::{Error, Result};

/// Longest remote error message carried into an error value.
const MAX_REMOTE_MESSAGE_CHARS: usize = 200;

/// Successful token endpoint response for both exchange and refresh.
#[derive(Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
    /// Marketplace user id; sent as a JSON number by the live API.
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry in unix milliseconds.
    pub fn expires_at(&self, now_millis: u64) -> u64 {
        now_millis.saturating_add(self.expires_in.saturating_mul(1000))
    }

    /// Store write for this response, issued at `now_millis`.
    pub fn into_upsert(self, now_millis: u64) -> CredentialUpsert {
        let expires_at = self.expires_at(now_millis);
        CredentialUpsert {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            scope: self.scope,
            issued_at: now_millis,
            expires_at,
        }
    }
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("scope", &self.scope)
            .field("user_id", &self.user_id)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

/// Error body shape shared by Mercado Livre and RFC 6749 servers.
#[derive(Deserialize)]
struct RemoteError {
    error: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
}

/// Static token endpoint settings.
pub struct TokenClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub timeout: Duration,
}

/// Client for the marketplace token endpoint.
pub struct TokenClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Secret<String>,
    redirect_uri: String,
}

impl TokenClient {
    pub fn new(config: TokenClientConfig) -> Result<Self> {
        if config.client_id.trim().is_empty() {
            return Err(Error::Configuration("client_id must not be empty".into()));
        }
        if config.client_secret.is_empty() {
            return Err(Error::Configuration(
                "client_secret must not be empty".into(),
            ));
        }
        if config.redirect_uri.trim().is_empty() {
            return Err(Error::Configuration(
                "redirect_uri must not be empty".into(),
            ));
        }
        if config.timeout.is_zero() {
            return Err(Error::Configuration(
                "token request timeout must be greater than 0".into(),
            ));
        }
        url::Url::parse(&config.token_url)
            .map_err(|e| Error::Configuration(format!("token_url is not a URL: {e}")))?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            token_url: config.token_url,
            client_id: config.client_id,
            client_secret: config.client_secret,
            redirect_uri: config.redirect_uri,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Exchange an authorization code for tokens.
    ///
    /// Sends the PKCE verifier to prove this party initiated the flow.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenResponse> {
        self.post_form(
            "authorization_code",
            &[
                ("grant_type", "authorization_code"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code_verifier", verifier),
            ],
        )
        .await
    }

    /// Refresh an access token. 401/403 means the refresh token was revoked.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let result = self
            .post_form(
                "refresh_token",
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.expose()),
                    ("refresh_token", refresh_token),
                ],
            )
            .await;

        match result {
            Err(Error::Rejected {
                status: status @ (401 | 403),
                code,
                ..
            }) => Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {}",
                code.as_deref().unwrap_or("unknown_error")
            ))),
            // Mercado Livre answers a revoked refresh token with 400 invalid_grant
            Err(Error::Rejected {
                status: 400,
                code: Some(code),
                ..
            }) if code == "invalid_grant" => Err(Error::InvalidCredentials(
                "refresh token rejected (400): invalid_grant".into(),
            )),
            other => other,
        }
    }

    /// Refresh with up to `max_attempts` tries, retrying only transport
    /// failures, `delay` apart.
    pub async fn refresh_with_retry(
        &self,
        refresh_token: &str,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<TokenResponse> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.refresh(refresh_token).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, error = %e, "token refresh failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn post_form(&self, grant: &str, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{grant} request: {}", e.without_url()))
                } else {
                    Error::Http(format!("{grant} request failed: {}", e.without_url()))
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("{grant} response: {}", e.without_url()))
            } else {
                Error::Http(format!("reading {grant} response: {}", e.without_url()))
            }
        })?;

        if !status.is_success() {
            let remote: Option<RemoteError> = serde_json::from_str(&body).ok();
            let code = remote.as_ref().and_then(|r| r.error.clone());
            let message = remote
                .and_then(|r| r.error_description.or(r.message))
                .map(|m| m.chars().take(MAX_REMOTE_MESSAGE_CHARS).collect());
            debug!(grant, status = status.as_u16(), code = ?code, "token endpoint rejected request");
            return Err(Error::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| Error::MalformedResponse {
                status: status.as_u16(),
                detail: e.to_string(),
            })?;
        if token.access_token.is_empty() || token.user_id.is_empty() {
            return Err(Error::MalformedResponse {
                status: status.as_u16(),
                detail: "empty access_token or user_id".into(),
            });
        }
        Ok(token)
    }
}

impl fmt::Debug for TokenClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenClient")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret)
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}
