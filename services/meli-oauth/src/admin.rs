//! Credential management endpoints
//!
//! Endpoints:
//! - GET    /oauth/credentials/{subject_id}          credential status
//! - DELETE /oauth/credentials/{subject_id}          revoke (deactivate)
//! - POST   /oauth/credentials/{subject_id}/refresh  forced refresh
//!
//! Responses never carry access or refresh tokens.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use meli_auth::{Credential, CredentialStore};
use tracing::{info, instrument};

use crate::AppState;
use crate::error::Error;

/// Public view of a stored credential.
fn credential_status(credential: &Credential) -> serde_json::Value {
    serde_json::json!({
        "subject_id": credential.subject_id,
        "scope": credential.scope,
        "issued_at": credential.issued_at,
        "expires_at": credential.expires_at,
        "is_active": credential.is_active,
        "has_refresh_token": credential.refresh_token.is_some(),
    })
}

/// GET /oauth/credentials/{subject_id}
#[instrument(skip(state))]
pub async fn get_credential(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Response {
    match state.tokens.credential_store().get(&subject_id).await {
        Some(credential) => Json(credential_status(&credential)).into_response(),
        None => Error::Tokens(meli_tokens::Error::NotFound(subject_id)).into_response(),
    }
}

/// DELETE /oauth/credentials/{subject_id}
#[instrument(skip(state))]
pub async fn revoke_credential(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Response {
    match state.tokens.revoke(&subject_id).await {
        Ok(true) => {
            info!(subject_id, "credential revoked");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "subject_id": subject_id, "is_active": false })),
            )
                .into_response()
        }
        Ok(false) => Error::Tokens(meli_tokens::Error::NotFound(subject_id)).into_response(),
        Err(e) => Error::Tokens(e).into_response(),
    }
}

/// POST /oauth/credentials/{subject_id}/refresh
#[instrument(skip(state))]
pub async fn refresh_credential(
    State(state): State<AppState>,
    Path(subject_id): Path<String>,
) -> Response {
    match state.tokens.refresh_now(&subject_id).await {
        Ok(credential) => Json(credential_status(&credential)).into_response(),
        Err(e) => Error::Tokens(e).into_response(),
    }
}
