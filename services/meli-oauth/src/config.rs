//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret is loaded from MELI_CLIENT_SECRET or client_secret_file,
//! never stored in the TOML directly to avoid leaking secrets.

use common::Secret;
use meli_auth::{AUTHORIZATION_ENDPOINT, MAX_ATTEMPT_AGE, TOKEN_ENDPOINT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long in-flight requests get to finish after a shutdown signal
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Mercado Livre application settings
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// Path to a file containing the client secret (alternative to MELI_CLIENT_SECRET)
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    /// Key signing the state capsule, from MELI_STATE_SECRET. Falls back to
    /// the client secret.
    #[serde(skip)]
    pub state_secret: Option<Secret<String>>,
    #[serde(default = "default_authorization_url")]
    pub authorization_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_state_max_age")]
    pub state_max_age_secs: u64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Mark the mirror cookies `Secure`. Only disable for plain-http local runs.
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
}

/// Credential storage and renewal
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_authorization_url() -> String {
    AUTHORIZATION_ENDPOINT.into()
}

fn default_token_url() -> String {
    TOKEN_ENDPOINT.into()
}

fn default_state_max_age() -> u64 {
    MAX_ATTEMPT_AGE.as_secs()
}

fn default_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_refresh_threshold() -> u64 {
    900
}

fn require_http_url(name: &str, value: &str) -> common::Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| common::Error::Config(format!("{name} is not a valid URL ({e}): {value}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(common::Error::Config(format!(
            "{name} must use http or https, got: {value}"
        )));
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(common::Error::Config(format!("{name} has no host: {value}")));
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client secret resolution order:
    /// 1. MELI_CLIENT_SECRET env var
    /// 2. client_secret_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Some(id) = non_empty_env("MELI_CLIENT_ID") {
            config.oauth.client_id = id;
        }
        if let Some(uri) = non_empty_env("MELI_REDIRECT_URI") {
            config.oauth.redirect_uri = uri;
        }

        if let Some(secret) = non_empty_env("MELI_CLIENT_SECRET") {
            config.oauth.client_secret = Some(Secret::new(secret));
        } else if let Some(ref secret_file) = config.oauth.client_secret_file {
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read client_secret_file {}: {e}",
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                config.oauth.client_secret = Some(Secret::new(secret));
            }
        }

        config.oauth.state_secret = non_empty_env("MELI_STATE_SECRET").map(Secret::new);

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let oauth = &self.oauth;
        if oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config(
                "client_id is required (oauth.client_id or MELI_CLIENT_ID)".into(),
            ));
        }
        if oauth.redirect_uri.trim().is_empty() {
            return Err(common::Error::Config(
                "redirect_uri is required (oauth.redirect_uri or MELI_REDIRECT_URI)".into(),
            ));
        }
        if oauth.client_secret.is_none() {
            return Err(common::Error::Config(
                "client secret is required (MELI_CLIENT_SECRET or oauth.client_secret_file)"
                    .into(),
            ));
        }
        require_http_url("redirect_uri", &oauth.redirect_uri)?;
        require_http_url("authorization_url", &oauth.authorization_url)?;
        require_http_url("token_url", &oauth.token_url)?;

        if oauth.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if oauth.state_max_age_secs == 0 || oauth.state_max_age_secs > MAX_ATTEMPT_AGE.as_secs() {
            return Err(common::Error::Config(format!(
                "state_max_age_secs must be between 1 and {}, got: {}",
                MAX_ATTEMPT_AGE.as_secs(),
                oauth.state_max_age_secs
            )));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.credentials.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Key for signing the state capsule.
    pub fn state_key(&self) -> &[u8] {
        self.oauth
            .state_secret
            .as_ref()
            .or(self.oauth.client_secret.as_ref())
            .map(|s| s.expose().as_bytes())
            .unwrap_or_default()
    }

    pub fn state_max_age(&self) -> Duration {
        Duration::from_secs(self.oauth.state_max_age_secs)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.oauth.timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("meli-oauth.toml")
    }
}
