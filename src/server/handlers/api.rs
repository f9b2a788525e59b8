//! Implementation of the token and admin management API.
//!
//! All routes live under `/auth/api/v1`. Authorization is uniform:
//! `admin:token` permits every token operation on any owner, `user:token`
//! permits operations on the caller's own tokens, anything else is a 403.
//! The bootstrap token acts as a super-admin with the fixed username
//! `<bootstrap>` and is honored only on the token and admin routes.
//!
//! # Endpoints
//!
//! - `GET /tokens`, `POST /tokens`
//! - `GET /tokens/{key}`, `PATCH /tokens/{key}`, `DELETE /tokens/{key}`
//! - `GET /tokens/{key}/change-history`
//! - `GET /admins`, `POST /admins`, `DELETE /admins/{username}`
//! - `GET /user-info`, `GET /token-info`

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::errors::ApiError;
use crate::scopes::USER_TOKEN_SCOPE;
use crate::server::auth::{ApiCaller, authenticate_api, client_ip};
use crate::state::AppState;
use crate::token::store::{CreateToken, StoreError, TokenUpdate};
use crate::token::{TokenInfo, TokenKind};

pub fn router() -> Router {
    Router::new()
        .route("/tokens", get(list_tokens).post(create_token))
        .route(
            "/tokens/{key}",
            get(get_token).patch(patch_token).delete(delete_token),
        )
        .route("/tokens/{key}/change-history", get(token_history))
        .route("/admins", get(list_admins).post(create_admin))
        .route("/admins/{username}", delete(delete_admin))
        .route("/user-info", get(user_info))
        .route("/token-info", get(token_info))
}

#[derive(Debug, Deserialize)]
struct TokenListQuery {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateTokenRequest {
    username: Option<String>,
    token_name: Option<String>,
    #[serde(default)]
    scopes: Vec<String>,
    expires: Option<DateTime<Utc>>,
    token_type: Option<TokenKind>,
}

#[derive(Debug, Serialize)]
struct CreatedToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct TokenPatch {
    scopes: Option<Vec<String>>,
    token_name: Option<String>,
    /// `"expires": null` clears the expiration; an absent field leaves it
    /// alone.
    #[serde(default, deserialize_with = "double_option")]
    expires: Option<Option<DateTime<Utc>>>,
}

fn double_option<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Option<DateTime<Utc>>>, D::Error> {
    Option::<DateTime<Utc>>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Serialize, Deserialize)]
struct AdminEntry {
    username: String,
}

/// `GET /tokens` - list tokens, filtered to the caller unless the caller is
/// an admin.
async fn list_tokens(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenListQuery>,
) -> Result<Json<Vec<TokenInfo>>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    let filter = if caller.is_admin() {
        query.username
    } else if caller.has_scope(USER_TOKEN_SCOPE) {
        if let Some(username) = &query.username
            && username != caller.username()
        {
            return Err(ApiError::Forbidden);
        }
        Some(caller.username().to_string())
    } else {
        return Err(ApiError::Forbidden);
    };
    let tokens = state.store.list(filter.as_deref()).await?;
    Ok(Json(tokens))
}

/// `POST /tokens` - create a user (or, for admins, service) token.
async fn create_token(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    if !caller.is_admin() && !caller.has_scope(USER_TOKEN_SCOPE) {
        return Err(ApiError::Forbidden);
    }

    let username = body
        .username
        .unwrap_or_else(|| caller.username().to_string());
    if username != caller.username() && !caller.is_admin() {
        return Err(ApiError::Forbidden);
    }

    let kind = body.token_type.unwrap_or(TokenKind::User);
    match kind {
        TokenKind::User => {}
        TokenKind::Service => {
            if !caller.is_admin() {
                return Err(ApiError::Forbidden);
            }
        }
        other => {
            return Err(ApiError::validation(
                format!("{} tokens cannot be created via the API", other.as_str()),
                &["body", "token_type"],
            ));
        }
    }

    let scopes: BTreeSet<String> = body.scopes.into_iter().collect();
    validate_known_scopes(&state, &scopes)?;
    require_scope_subset(&caller, &scopes)?;

    let ip = client_ip(&headers, &state.proxies);
    let data = state
        .store
        .create(
            CreateToken {
                username,
                kind,
                scopes,
                expires: body.expires,
                token_name: body.token_name,
                parent: None,
                email: None,
            },
            None,
            caller.username(),
            ip.as_deref(),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedToken {
            token: data.token.encode(),
        }),
    ))
}

/// `GET /tokens/{key}` - public projection of one token.
async fn get_token(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<TokenInfo>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    let info = load_authorized(&state, &caller, &key).await?;
    Ok(Json(info))
}

/// `PATCH /tokens/{key}` - change scopes, name, or expiration.
async fn patch_token(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(patch): Json<TokenPatch>,
) -> Result<Json<TokenInfo>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    load_authorized(&state, &caller, &key).await?;

    let scopes = patch.scopes.map(|s| s.into_iter().collect::<BTreeSet<_>>());
    if let Some(scopes) = &scopes {
        validate_known_scopes(&state, scopes)?;
        require_scope_subset(&caller, scopes)?;
    }
    let update = TokenUpdate {
        scopes,
        token_name: patch.token_name.map(Some),
        expires: patch.expires,
    };
    if update.is_empty() {
        return Err(ApiError::validation("no fields to modify", &["body"]));
    }

    let ip = client_ip(&headers, &state.proxies);
    let info = state
        .store
        .modify(&key, update, caller.username(), ip.as_deref())
        .await
        .map_err(|e| match e {
            StoreError::DuplicateTokenName => ApiError::DuplicateTokenName { modifying: true },
            other => ApiError::from(other),
        })?;
    Ok(Json(info))
}

/// `DELETE /tokens/{key}` - revoke a token and all its descendants.
async fn delete_token(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    load_authorized(&state, &caller, &key).await?;

    let ip = client_ip(&headers, &state.proxies);
    let revoked = state
        .store
        .revoke(&key, caller.username(), ip.as_deref())
        .await?;
    if revoked {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// `GET /tokens/{key}/change-history`.
async fn token_history(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    load_authorized(&state, &caller, &key).await?;
    let history = state.store.history(&key).await?;
    Ok(Json(history))
}

/// `GET /admins` - admin only.
async fn list_admins(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<AdminEntry>>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    require_admin(&caller)?;
    let admins = state
        .db
        .list_admins()
        .await
        .map_err(|e| backend_unavailable("listing admins", e))?;
    Ok(Json(
        admins
            .into_iter()
            .map(|username| AdminEntry { username })
            .collect(),
    ))
}

/// `POST /admins` - add an admin.
async fn create_admin(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AdminEntry>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    require_admin(&caller)?;
    state
        .db
        .add_admin(body.username.clone())
        .await
        .map_err(|e| backend_unavailable("adding admin", e))?;
    tracing::info!(
        actor = caller.username(),
        username = body.username.as_str(),
        "admin added"
    );
    Ok(StatusCode::CREATED)
}

/// `DELETE /admins/{username}` - remove an admin.
async fn delete_admin(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    require_admin(&caller)?;
    let removed = state
        .db
        .remove_admin(username.clone())
        .await
        .map_err(|e| backend_unavailable("removing admin", e))?;
    if removed {
        tracing::info!(
            actor = caller.username(),
            username = username.as_str(),
            "admin removed"
        );
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// `GET /user-info` - identity of the presented token.
async fn user_info(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    let ApiCaller::Token(data) = caller else {
        // The bootstrap token is honored only on the token and admin routes.
        return Err(ApiError::Forbidden);
    };
    Ok(Json(serde_json::json!({
        "username": data.username,
        "email": data.email,
        "scopes": data.scopes,
    })))
}

/// `GET /token-info` - public projection of the presented token.
async fn token_info(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TokenInfo>, ApiError> {
    let caller = authenticate_api(&state, &headers).await?;
    let ApiCaller::Token(data) = caller else {
        return Err(ApiError::Forbidden);
    };
    Ok(Json(data.info()))
}

/// Fetch a token's info, enforcing the ownership rule.
async fn load_authorized(
    state: &AppState,
    caller: &ApiCaller,
    key: &str,
) -> Result<TokenInfo, ApiError> {
    let info = state
        .store
        .get_info(key)
        .await?
        .ok_or(ApiError::NotFound)?;
    if caller.is_admin() {
        return Ok(info);
    }
    if caller.has_scope(USER_TOKEN_SCOPE) && info.username == caller.username() {
        return Ok(info);
    }
    Err(ApiError::Forbidden)
}

fn require_admin(caller: &ApiCaller) -> Result<(), ApiError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Non-admin callers can only grant scopes they themselves hold.
fn require_scope_subset(caller: &ApiCaller, scopes: &BTreeSet<String>) -> Result<(), ApiError> {
    if caller.is_admin() {
        return Ok(());
    }
    if scopes.iter().all(|scope| caller.has_scope(scope)) {
        Ok(())
    } else {
        Err(ApiError::InsufficientScope)
    }
}

fn validate_known_scopes(state: &AppState, scopes: &BTreeSet<String>) -> Result<(), ApiError> {
    for scope in scopes {
        if !state.settings.known_scopes.contains_key(scope) {
            return Err(ApiError::validation(
                format!("unknown scope {}", scope),
                &["body", "scopes"],
            ));
        }
    }
    Ok(())
}

fn backend_unavailable(context: &str, e: crate::server::persist::PersistError) -> ApiError {
    tracing::error!("{} failed: {:#}", context, e);
    ApiError::Unavailable
}
