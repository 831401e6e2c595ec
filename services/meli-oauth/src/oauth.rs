//! Seller-facing OAuth endpoints
//!
//! - GET /oauth/login: start an attempt, set the mirror cookies, 303 to
//!   Mercado Livre
//! - GET /oauth/callback: finish the attempt, always answers JSON

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use meli_auth::{CallbackParams, SecondaryChannel, STATE_COOKIE, VERIFIER_COOKIE};
use tracing::{instrument, warn};

use crate::AppState;
use crate::error::Error;
use crate::metrics;

/// Attributes shared by both mirror cookies.
#[derive(Debug, Clone, Copy)]
pub struct CookieSettings {
    pub secure: bool,
    pub max_age: Duration,
}

fn mirror_cookie(name: &'static str, value: String, settings: CookieSettings) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .secure(settings.secure)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(settings.max_age.as_secs() as i64))
        .build()
}

fn removal_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, "")).path("/").build()
}

/// GET /oauth/login
#[instrument(skip_all)]
pub async fn login(State(state): State<AppState>, jar: CookieJar) -> Response {
    let request = match state.initiator.begin().await {
        Ok(request) => request,
        Err(e) => return Error::Initiate(e).into_response(),
    };
    metrics::record_initiation();

    let jar = jar
        .add(mirror_cookie(STATE_COOKIE, request.state.clone(), state.cookies))
        .add(mirror_cookie(VERIFIER_COOKIE, request.verifier.clone(), state.cookies));

    (jar, Redirect::to(&request.url)).into_response()
}

/// GET /oauth/callback
#[instrument(skip_all)]
pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    query: Result<Query<CallbackParams>, QueryRejection>,
) -> Response {
    let params = match query {
        Ok(Query(params)) => params,
        Err(e) => {
            // Unparsable query: treated as a callback carrying nothing usable
            warn!(error = %e, "malformed callback query");
            CallbackParams::default()
        }
    };
    let secondary = SecondaryChannel {
        state: jar.get(STATE_COOKIE).map(|c| c.value().to_owned()),
        verifier: jar.get(VERIFIER_COOKIE).map(|c| c.value().to_owned()),
    };

    let started = Instant::now();
    let result = state.exchanger.complete(&params, &secondary).await;
    let elapsed = started.elapsed().as_secs_f64();

    // The attempt is over whatever the outcome
    let jar = jar
        .remove(removal_cookie(STATE_COOKIE))
        .remove(removal_cookie(VERIFIER_COOKIE));

    match result {
        Ok(outcome) => {
            state.tokens.on_exchanged(&outcome.credential).await;
            metrics::record_callback("success");
            metrics::record_exchange_duration("success", elapsed);
            let body = serde_json::json!({
                "ok": true,
                "user_id": outcome.credential.subject_id,
                "scope": outcome.credential.scope,
                "expires_at": outcome.credential.expires_at,
                "recovered_via": outcome.recovered_via.as_str(),
            });
            (jar, Json(body)).into_response()
        }
        Err(e) => {
            let reason = e.reason();
            metrics::record_callback(reason);
            if matches!(e.step(), "exchange" | "persist") {
                metrics::record_exchange_duration(reason, elapsed);
            }
            (jar, Error::Callback(e)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_cookie_attributes() {
        let cookie = mirror_cookie(
            STATE_COOKIE,
            "abc".into(),
            CookieSettings {
                secure: true,
                max_age: Duration::from_secs(900),
            },
        );
        assert_eq!(cookie.name(), "meli_oauth_state");
        assert_eq!(cookie.value(), "abc");
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(900)));
    }

    #[test]
    fn insecure_cookies_for_local_runs() {
        let cookie = mirror_cookie(
            VERIFIER_COOKIE,
            "v".into(),
            CookieSettings {
                secure: false,
                max_age: Duration::from_secs(60),
            },
        );
        assert_eq!(cookie.secure(), Some(false));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(60)));
    }
}
