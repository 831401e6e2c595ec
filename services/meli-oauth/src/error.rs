//! Service-specific error types
//!
//! Every request-level failure is answered with a JSON body; nothing
//! reaches the client as a bare 500 or a stack trace.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use meli_auth::CallbackError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("authorization could not be started: {0}")]
    Initiate(meli_auth::Error),

    #[error(transparent)]
    Tokens(#[from] meli_tokens::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Callback(e) => {
                StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Error::Initiate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Tokens(meli_tokens::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Tokens(meli_tokens::Error::Revoked(_)) => StatusCode::GONE,
            Error::Tokens(meli_tokens::Error::RefreshFailed(_)) => StatusCode::BAD_GATEWAY,
            Error::Tokens(meli_tokens::Error::Credential(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> serde_json::Value {
        match self {
            Error::Callback(e) => {
                let mut body = serde_json::json!({
                    "ok": false,
                    "step": e.step(),
                    "reason": e.reason(),
                    "error": e.to_string(),
                    "retryable": e.is_retryable(),
                });
                match e {
                    CallbackError::RemoteDenied { error, description } => {
                        body["remote_error"] = error.as_str().into();
                        if let Some(description) = description {
                            body["error_description"] = description.as_str().into();
                        }
                    }
                    CallbackError::StateExpired {
                        age_secs,
                        max_age_secs,
                    } => {
                        body["age_secs"] = (*age_secs).into();
                        body["max_age_secs"] = (*max_age_secs).into();
                    }
                    CallbackError::ExchangeRejected {
                        status,
                        code,
                        message,
                    } => {
                        body["remote_status"] = (*status).into();
                        if let Some(code) = code {
                            body["remote_error"] = code.as_str().into();
                        }
                        if let Some(message) = message {
                            body["remote_message"] = message.as_str().into();
                        }
                    }
                    _ => {}
                }
                body
            }
            Error::Initiate(e) => serde_json::json!({
                "ok": false,
                "step": "initiate",
                "reason": "initiate_failed",
                "error": e.to_string(),
            }),
            Error::Tokens(e) => serde_json::json!({
                "ok": false,
                "reason": match e {
                    meli_tokens::Error::NotFound(_) => "not_found",
                    meli_tokens::Error::Revoked(_) => "revoked",
                    meli_tokens::Error::RefreshFailed(_) => "refresh_failed",
                    meli_tokens::Error::Credential(_) => "store_error",
                },
                "error": e.to_string(),
                "reauthorize": e.requires_reauthorization(),
            }),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_errors_keep_their_status() {
        let err = Error::from(CallbackError::ReplayDetected);
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.body()["reason"], "replay");
        assert_eq!(err.body()["ok"], false);

        let err = Error::from(CallbackError::NetworkTimeout);
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.body()["retryable"], true);
    }

    #[test]
    fn exchange_rejection_carries_remote_details() {
        let err = Error::from(CallbackError::ExchangeRejected {
            status: 400,
            code: Some("invalid_grant".into()),
            message: Some("code expired".into()),
        });
        let body = err.body();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body["step"], "exchange");
        assert_eq!(body["remote_status"], 400);
        assert_eq!(body["remote_error"], "invalid_grant");
        assert_eq!(body["remote_message"], "code expired");
    }

    #[test]
    fn remote_denial_carries_description() {
        let err = Error::from(CallbackError::RemoteDenied {
            error: "access_denied".into(),
            description: Some("user declined".into()),
        });
        let body = err.body();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body["remote_error"], "access_denied");
        assert_eq!(body["error_description"], "user declined");
    }

    #[test]
    fn token_errors_map_to_statuses() {
        let cases = [
            (meli_tokens::Error::NotFound("U1".into()), StatusCode::NOT_FOUND),
            (meli_tokens::Error::Revoked("U1".into()), StatusCode::GONE),
            (
                meli_tokens::Error::RefreshFailed("timeout".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (e, status) in cases {
            assert_eq!(Error::from(e).status(), status);
        }
        let body = Error::from(meli_tokens::Error::Revoked("U1".into())).body();
        assert_eq!(body["reauthorize"], true);
    }
}
