//! Error types for OAuth protocol operations

/// Errors from PKCE, state, token endpoint and credential store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint timed out: {0}")]
    Timeout(String),

    #[error("token endpoint returned {status}: {}", .code.as_deref().unwrap_or("unknown_error"))]
    Rejected {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },

    #[error("malformed token response ({status}): {detail}")]
    MalformedResponse { status: u16, detail: String },

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Transport-level failures that may succeed on a later attempt.
    /// Only idempotent calls (refresh) act on this.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Http(_))
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
