//! Error types for startup and for the HTTP surface.
//!
//! Startup failures are fatal and map to a nonzero exit; request-time
//! failures are expressed as [`ApiError`], which every JSON handler returns
//! and which renders as the standard `{"detail": [{"msg", "type", "loc"}]}`
//! body with the status code mandated by the error kind.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::server::providers::ProviderError;
use crate::token::store::StoreError;

/// Fatal errors raised before the server starts listening.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Token signing misconfigured: {0}")]
    SigningMisconfigured(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Request-time error taxonomy for the JSON API surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    InvalidCredentials,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token missing required scope")]
    InsufficientScope,

    #[error("Permission denied")]
    Forbidden,

    #[error("Not found")]
    NotFound,

    #[error("Token name already in use")]
    DuplicateTokenName {
        /// A duplicate on modify renders as 422, on create as 409.
        modifying: bool,
    },

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("{msg}")]
    Validation {
        msg: String,
        loc: Option<Vec<String>>,
    },

    #[error("Upstream provider error: {0}")]
    Provider(String),

    #[error("Backend temporarily unavailable")]
    Unavailable,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Build a 422 validation error pointing at a request location.
    pub fn validation(msg: impl Into<String>, loc: &[&str]) -> Self {
        ApiError::Validation {
            msg: msg.into(),
            loc: Some(loc.iter().map(|s| s.to_string()).collect()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentials | ApiError::TokenExpired => StatusCode::UNAUTHORIZED,
            ApiError::InsufficientScope | ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::DuplicateTokenName { modifying: false } => StatusCode::CONFLICT,
            ApiError::DuplicateTokenName { modifying: true }
            | ApiError::MalformedToken(_)
            | ApiError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Provider(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error type tag carried in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::TokenExpired => "token_expired",
            ApiError::InsufficientScope => "insufficient_scope",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound => "not_found",
            ApiError::DuplicateTokenName { .. } => "duplicate_token_name",
            ApiError::MalformedToken(_) => "malformed_token",
            ApiError::Validation { .. } => "validation",
            ApiError::Provider(_) => "provider_error",
            ApiError::Unavailable => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    msg: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    loc: Option<Vec<String>>,
}

#[derive(Serialize)]
struct ErrorBody {
    detail: Vec<ErrorDetail>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error: {:#}", self);
        }
        let loc = match &self {
            ApiError::Validation { loc, .. } => loc.clone(),
            _ => None,
        };
        let msg = match &self {
            // Never leak internal error chains to clients.
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            detail: vec![ErrorDetail {
                msg,
                kind: self.kind(),
                loc,
            }],
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateTokenName => ApiError::DuplicateTokenName { modifying: false },
            StoreError::NotFound => ApiError::NotFound,
            StoreError::ChildScopes => ApiError::InsufficientScope,
            StoreError::Expired => ApiError::TokenExpired,
            StoreError::Invalid(msg) => ApiError::Validation { msg, loc: None },
            StoreError::Backend(e) => {
                tracing::error!("storage backend failure: {:#}", e);
                ApiError::Unavailable
            }
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        // The full cause goes to the log; clients see a sanitized summary.
        tracing::warn!("upstream provider failure: {:#}", e);
        ApiError::Provider(e.sanitized())
    }
}
