//! Mercado Livre OAuth gateway
//!
//! Single-binary Rust service that:
//! 1. Sends sellers to Mercado Livre with an OAuth2 + PKCE authorization
//!    request whose `state` carries the code verifier
//! 2. Completes the callback, exchanging the code for tokens
//! 3. Stores one credential per seller and keeps it fresh
//! 4. Exposes health and Prometheus metrics

mod admin;
mod config;
mod error;
mod metrics;
mod oauth;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use meli_auth::{
    AttemptStore, Clock, CredentialStore, Exchanger, FileCredentialStore, Initiator,
    InitiatorConfig, MemoryAttemptStore, StateCodec, SystemClock, TokenClient, TokenClientConfig,
};
use meli_tokens::TokenProvider;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::oauth::CookieSettings;

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    initiator: Arc<Initiator>,
    exchanger: Arc<Exchanger>,
    tokens: Arc<TokenProvider>,
    attempts: Arc<MemoryAttemptStore>,
    cookies: CookieSettings,
    started_at: Instant,
    prometheus: PrometheusHandle,
}

impl AppState {
    /// Wire the flow components from configuration.
    fn new(
        config: &Config,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
        prometheus: PrometheusHandle,
    ) -> meli_auth::Result<Self> {
        let client_secret = config.oauth.client_secret.clone().ok_or_else(|| {
            meli_auth::Error::Configuration("client secret is not configured".into())
        })?;
        let max_age = config.state_max_age();

        let codec = Arc::new(StateCodec::new(config.state_key())?);
        let attempts = Arc::new(MemoryAttemptStore::new());
        let client = Arc::new(TokenClient::new(TokenClientConfig {
            token_url: config.oauth.token_url.clone(),
            client_id: config.oauth.client_id.clone(),
            client_secret,
            redirect_uri: config.oauth.redirect_uri.clone(),
            timeout: config.token_timeout(),
        })?);

        let initiator = Initiator::new(
            InitiatorConfig {
                authorization_url: config.oauth.authorization_url.clone(),
                client_id: config.oauth.client_id.clone(),
                redirect_uri: config.oauth.redirect_uri.clone(),
                scope: config.oauth.scope.clone(),
                max_age,
            },
            codec.clone(),
            attempts.clone() as Arc<dyn AttemptStore>,
            clock.clone(),
        )?;
        let exchanger = Exchanger::new(
            client.clone(),
            codec,
            attempts.clone(),
            credentials.clone(),
            clock.clone(),
            max_age,
        );
        let tokens = TokenProvider::new(credentials, client, clock);

        Ok(Self {
            initiator: Arc::new(initiator),
            exchanger: Arc::new(exchanger),
            tokens: Arc::new(tokens),
            attempts,
            cookies: CookieSettings {
                secure: config.oauth.cookie_secure,
                max_age,
            },
            started_at: Instant::now(),
            prometheus,
        })
    }
}

/// Build the axum router with all routes and shared state.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/oauth/login", get(oauth::login))
        .route("/oauth/callback", get(oauth::callback))
        .route(
            "/oauth/credentials/{subject_id}",
            get(admin::get_credential).delete(admin::revoke_credential),
        )
        .route(
            "/oauth/credentials/{subject_id}/refresh",
            post(admin::refresh_credential),
        )
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting meli-oauth-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        client_id = %config.oauth.client_id,
        redirect_uri = %config.oauth.redirect_uri,
        token_url = %config.oauth.token_url,
        state_max_age_secs = config.oauth.state_max_age_secs,
        separate_state_key = config.oauth.state_secret.is_some(),
        "configuration loaded"
    );

    let credentials = FileCredentialStore::load(config.credentials.path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to load credentials from {}",
                config.credentials.path.display()
            )
        })?;
    info!(credentials = credentials.len().await, "credential store loaded");

    let app_state = AppState::new(
        &config,
        Arc::new(credentials),
        Arc::new(SystemClock),
        prometheus_handle,
    )
    .context("invalid OAuth configuration")?;

    let refresh_task = meli_tokens::spawn_refresh_task(
        app_state.tokens.clone(),
        Duration::from_secs(config.credentials.refresh_interval_secs),
        Duration::from_secs(config.credentials.refresh_threshold_secs),
    );

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts: signal the server to drain, then race the drain against
    // the timeout.
    let drain_timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    refresh_task.abort();
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(drain_timeout, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: status, uptime and credential counts.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.tokens.credential_store();
    let ids = store.subject_ids().await;
    let mut active = 0usize;
    for id in &ids {
        if store.get(id).await.is_some_and(|c| c.is_active) {
            active += 1;
        }
    }

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "status": "healthy",
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "credentials_total": ids.len(),
            "credentials_active": active,
            "pending_attempts": state.attempts.pending_len().await,
        })
        .to_string(),
    )
}

/// Prometheus metrics endpoint, text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
