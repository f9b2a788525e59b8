//! Browser login flow: `/login`, `/logout`, and the OIDC callback alias.
//!
//! A browser session moves through three states. With no cookie (or no
//! token in it) the session is unauthenticated; `GET /login` stores CSRF
//! state plus the return URL in the cookie and redirects to the provider
//! (login pending). The provider redirects back with `code` and `state`;
//! after a constant-time state check and the code exchange, a session token
//! is created, its wire form replaces the login state in the cookie, and
//! the browser returns to the carried URL (authenticated). Any callback
//! failure clears the cookie so a wedged pending login always recovers.

use axum::{
    body::Body,
    extract::{Extension, RawQuery},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use url::{Url, form_urlencoded};

use crate::errors::ApiError;
use crate::scopes::session_scopes;
use crate::server::auth::client_ip;
use crate::server::session::{
    SessionCookie, clear_cookie_header, generate_state, set_cookie_header,
};
use crate::state::AppState;
use crate::token::store::CreateToken;
use crate::token::{Token, TokenKind};

/// `GET /login` - both the login initiation and the provider callback,
/// distinguished by the presence of `code` and `state`.
pub async fn login_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let params: HashMap<String, String> =
        form_urlencoded::parse(query.as_deref().unwrap_or_default().as_bytes())
            .into_owned()
            .collect();

    if let (Some(code), Some(login_state)) = (params.get("code"), params.get("state")) {
        handle_callback(&state, &headers, code, login_state, params.get("error")).await
    } else {
        initiate_login(&state, &headers, params.get("rd")).await
    }
}

/// `GET /logout` - revoke the session token, clear the cookie, and send the
/// browser to the configured post-logout page.
pub async fn logout_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let lifetime = state.settings.token_lifetime();
    if let Some(session) = SessionCookie::from_headers(&headers, &state.sealer, lifetime)
        && let Some(wire) = session.token
        && let Ok(token) = Token::parse(&wire)
    {
        match state.store.get(&token).await {
            Ok(Some(data)) => {
                let ip = client_ip(&headers, &state.proxies);
                if let Err(e) = state
                    .store
                    .revoke(token.key(), &data.username, ip.as_deref())
                    .await
                {
                    return ApiError::from(e).into_response();
                }
                tracing::info!(username = data.username.as_str(), "logged out");
            }
            Ok(None) => {
                tracing::debug!("logout with already-invalid session token");
            }
            Err(e) => return ApiError::from(e).into_response(),
        }
    }

    redirect_with_cookie(&state.settings.after_logout_url, clear_cookie_header())
}

async fn initiate_login(
    state: &AppState,
    headers: &HeaderMap,
    return_url: Option<&String>,
) -> Response {
    if let Some(rd) = return_url
        && let Err(e) = validate_return_url(state, rd)
    {
        return e.into_response();
    }

    let lifetime = state.settings.token_lifetime();
    let session = SessionCookie::from_headers(headers, &state.sealer, lifetime);

    // An already-authenticated browser skips the provider round trip.
    if let Some(wire) = session.as_ref().and_then(|s| s.token.as_deref())
        && let Ok(token) = Token::parse(wire)
        && let Ok(Some(_)) = state.store.get(&token).await
    {
        let target = return_url
            .map(|rd| rd.to_string())
            .unwrap_or_else(|| state.settings.after_logout_url.clone());
        return redirect(&target);
    }

    let csrf = generate_state();
    let pending = SessionCookie {
        token: None,
        state: Some(csrf.clone()),
        return_url: return_url.map(|rd| rd.to_string()),
    };
    let authorize = state.provider.authorize_url(&csrf);
    tracing::debug!("redirecting browser to the upstream provider");
    redirect_with_cookie(
        &authorize,
        set_cookie_header(&pending.seal(&state.sealer), lifetime),
    )
}

async fn handle_callback(
    state: &AppState,
    headers: &HeaderMap,
    code: &str,
    login_state: &str,
    provider_error: Option<&String>,
) -> Response {
    let lifetime = state.settings.token_lifetime();
    let Some(session) = SessionCookie::from_headers(headers, &state.sealer, lifetime) else {
        return login_failure(state, "No login in progress", None);
    };
    let Some(expected_state) = &session.state else {
        return login_failure(state, "No login in progress", None);
    };

    if let Some(error) = provider_error {
        return login_failure(
            state,
            "Provider reported an error",
            Some(format!("provider error: {}", error)),
        );
    }
    let state_matches: bool = expected_state
        .as_bytes()
        .ct_eq(login_state.as_bytes())
        .into();
    if !state_matches {
        return login_failure(
            state,
            "Login state mismatch",
            Some("callback state does not match the session state".to_string()),
        );
    }

    let user = match state.provider.exchange(code).await {
        Ok(user) => user,
        Err(e) => {
            return login_failure(state, &e.sanitized(), Some(format!("{:#}", e)));
        }
    };

    let is_admin = match state.db.is_admin(user.username.clone()).await {
        Ok(is_admin) => is_admin,
        Err(e) => {
            tracing::error!("admin lookup failed during login: {:#}", e);
            return ApiError::Unavailable.into_response();
        }
    };

    if user.groups.is_empty() && !state.settings.group_mapping.is_empty() {
        return login_failure(
            state,
            "User is not a member of any authorized group",
            Some(format!("{} has no provider groups", user.username)),
        );
    }

    let scopes = session_scopes(&user.groups, &state.settings.group_mapping, is_admin);
    let expires = Utc::now() + chrono::Duration::from_std(lifetime).expect("fits chrono");
    let request = CreateToken {
        username: user.username.clone(),
        kind: TokenKind::Session,
        scopes,
        expires: Some(expires),
        token_name: None,
        parent: None,
        email: user.email.clone(),
    };
    let ip = client_ip(headers, &state.proxies);
    let data = match state
        .store
        .create(request, None, &user.username, ip.as_deref())
        .await
    {
        Ok(data) => data,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let granted = data.scopes.iter().cloned().collect::<Vec<_>>().join(" ");
    tracing::info!(
        username = user.username.as_str(),
        scopes = granted.as_str(),
        "login complete"
    );

    let authenticated = SessionCookie {
        token: Some(data.token.encode()),
        state: None,
        return_url: None,
    };
    let target = session
        .return_url
        .unwrap_or_else(|| state.settings.after_logout_url.clone());
    redirect_with_cookie(
        &target,
        set_cookie_header(&authenticated.seal(&state.sealer), lifetime),
    )
}

/// A return URL must point back at this deployment.
fn validate_return_url(state: &AppState, rd: &str) -> Result<(), ApiError> {
    let parsed = Url::parse(rd)
        .map_err(|_| ApiError::validation("rd is not a valid URL", &["query", "rd"]))?;
    if parsed.host_str() != Some(state.settings.realm.as_str()) {
        return Err(ApiError::validation(
            "rd is not at the configured host",
            &["query", "rd"],
        ));
    }
    Ok(())
}

/// Render a login failure: 403 with a human-readable reason and an opaque
/// correlation id, the cause in the structured log under the same id, and
/// the session cookie cleared to recover from a wedged pending login.
fn login_failure(state: &AppState, reason: &str, cause: Option<String>) -> Response {
    let correlation = hex::encode(rand::random::<[u8; 8]>());
    match cause {
        Some(cause) => {
            tracing::warn!(correlation = correlation.as_str(), "login failed: {}", cause)
        }
        None => tracing::warn!(correlation = correlation.as_str(), "login failed: {}", reason),
    }
    let body = serde_json::json!({
        "detail": [{
            "msg": format!("{} (ref {})", reason, correlation),
            "type": "login_failure",
        }]
    });
    let mut response = (StatusCode::FORBIDDEN, axum::Json(body)).into_response();
    if let Ok(value) = clear_cookie_header().parse() {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    response
}

fn redirect(target: &str) -> Response {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, target)
        .body(Body::empty())
        .unwrap()
        .into_response()
}

fn redirect_with_cookie(target: &str, cookie: String) -> Response {
    let mut response = redirect(target);
    match cookie.parse() {
        Ok(value) => {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
        Err(e) => {
            tracing::error!("could not render session cookie: {}", e);
            return ApiError::Internal(anyhow::anyhow!("unrepresentable session cookie"))
                .into_response();
        }
    }
    response
}
