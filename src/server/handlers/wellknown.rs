//! Well-known documents and the health probe.

use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};
use std::sync::Arc;

use crate::state::AppState;

/// `GET /.well-known/jwks.json` - public keys for verifying internal JWTs.
pub async fn jwks_handler(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.signer.jwks()))
}

/// `GET /health` - liveness probe for the ingress.
pub async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}
