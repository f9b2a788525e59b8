//! HTTP service implementation - router assembly and the serve loop.

use anyhow::{Context, Result};
use axum::{Extension, Router, routing::get};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::server::handlers::{api, auth, login, wellknown};
use crate::state::AppState;

/// How often the expiry sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Assemble the full route table.
///
/// Exposed separately from [`start`] so integration tests can drive the
/// router without binding a socket.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth", get(auth::auth_handler))
        .route("/auth/analyze", get(auth::analyze_handler))
        .route("/login", get(login::login_handler))
        .route("/logout", get(login::logout_handler))
        .route("/oauth2/callback", get(login::login_handler))
        .route("/.well-known/jwks.json", get(wellknown::jwks_handler))
        .route("/health", get(wellknown::health_handler))
        .nest("/auth/api/v1", api::router())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(state))
}

/// Bind and serve until ctrl-c or SIGTERM.
pub async fn start(state: Arc<AppState>) -> Result<()> {
    let bind_address = state.settings.bind_address.clone();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    info!("Listening on {}", bind_address);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(expiry_sweep(state.clone(), shutdown.clone()));

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("serving HTTP")?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("Server stopped");
    Ok(())
}

/// Periodically delete expired tokens, writing `expire` history rows.
async fn expiry_sweep(state: Arc<AppState>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        match state.store.sweep_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("expiry sweep removed {} tokens", n),
            Err(e) => tracing::warn!("expiry sweep failed: {:#}", e),
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
