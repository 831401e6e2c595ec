//! Startup-time error types
//!
//! Every variant here is fatal: the gateway refuses to start rather than
//! serve logins with a half-valid configuration.

use thiserror::Error;

/// Configuration and bootstrap errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("client_id must not be empty".into());
        assert_eq!(
            config_err.to_string(),
            "Configuration error: client_id must not be empty"
        );

        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(
            io_err.to_string().starts_with("I/O error:"),
            "got: {}",
            io_err
        );
    }

    #[test]
    fn toml_errors_convert() {
        let parsed: std::result::Result<toml::Table, _> = toml::from_str("not = = toml");
        let err: Error = parsed.unwrap_err().into();
        assert!(matches!(err, Error::Toml(_)));
    }
}
