//! Error types for token lifecycle operations

/// Errors from token lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credential for subject {0}")]
    NotFound(String),

    #[error("credential for subject {0} has been revoked")]
    Revoked(String),

    #[error("credential store error: {0}")]
    Credential(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

impl Error {
    /// Whether the seller has to authorize again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Revoked(_))
    }
}

/// Result alias for token lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
