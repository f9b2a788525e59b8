//! The `/auth` subrequest decision engine.
//!
//! NGINX issues an `auth_request` subrequest for every protected request.
//! This handler resolves the caller to a token, evaluates the scope
//! predicate, optionally mints a delegated child token, and renders either
//! identity headers on 200 or the 401/403 the ingress translates into a
//! login redirect or error page. The `X-Error-Status` and `X-Error-Body`
//! headers carry rendering hints because NGINX cannot read an auth
//! subrequest's body.

use axum::{
    Json,
    extract::{Extension, RawQuery},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use url::form_urlencoded;

use crate::errors::ApiError;
use crate::server::auth::{AuthType, Satisfy, client_ip, extract_credential, satisfies};
use crate::server::constants::{
    HEADER_AUTH_EMAIL, HEADER_AUTH_TOKEN, HEADER_AUTH_TOKEN_SCOPES, HEADER_AUTH_USER,
    HEADER_ERROR_BODY, HEADER_ERROR_STATUS, HEADER_ORIGINAL_METHOD, HEADER_ORIGINAL_URI,
    HEADER_SCOPES_ACCEPTED, HEADER_SCOPES_SATISFY,
};
use crate::state::AppState;
use crate::token::store::StoreError;
use crate::token::{Token, TokenData};

/// Parsed `/auth` query parameters.
#[derive(Debug, Default)]
pub struct AuthRequest {
    pub scopes: Vec<String>,
    pub satisfy: Satisfy,
    pub auth_type: AuthType,
    pub notebook: bool,
    pub delegate_to: Option<String>,
    pub delegate_scopes: Vec<String>,
    /// Deliver the delegated token as a signed JWT envelope instead of the
    /// opaque wire form.
    pub delegate_jwt: bool,
    pub minimum_lifetime: Option<i64>,
}

impl AuthRequest {
    pub fn from_query(query: Option<&str>) -> Result<Self, ApiError> {
        let mut request = AuthRequest::default();
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "scope" => request.scopes.push(value.into_owned()),
                "satisfy" => {
                    request.satisfy = Satisfy::from_param(&value).ok_or_else(|| {
                        ApiError::validation("satisfy must be all or any", &["query", "satisfy"])
                    })?;
                }
                "auth_type" => {
                    request.auth_type = AuthType::from_param(&value).ok_or_else(|| {
                        ApiError::validation(
                            "auth_type must be bearer or basic",
                            &["query", "auth_type"],
                        )
                    })?;
                }
                "notebook" => {
                    request.notebook = parse_bool(&value, "notebook")?;
                }
                "delegate_to" => request.delegate_to = Some(value.into_owned()),
                "delegate_scope" => request.delegate_scopes.push(value.into_owned()),
                "delegate_jwt" => {
                    request.delegate_jwt = parse_bool(&value, "delegate_jwt")?;
                }
                "minimum_lifetime" => {
                    let seconds: i64 = value.parse().map_err(|_| {
                        ApiError::validation(
                            "minimum_lifetime must be an integer number of seconds",
                            &["query", "minimum_lifetime"],
                        )
                    })?;
                    request.minimum_lifetime = Some(seconds);
                }
                _ => {}
            }
        }
        if request.notebook && request.delegate_to.is_some() {
            return Err(ApiError::validation(
                "notebook and delegate_to are mutually exclusive",
                &["query"],
            ));
        }
        Ok(request)
    }
}

fn parse_bool(value: &str, param: &str) -> Result<bool, ApiError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ApiError::validation(
            format!("{} must be true or false", param),
            &["query", param],
        )),
    }
}

/// `GET /auth` - the forward-auth decision.
pub async fn auth_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let request = match AuthRequest::from_query(query.as_deref()) {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };
    let challenge = request.auth_type.challenge(&state.settings.realm);
    let redirect = login_redirect(&state, &headers);

    let Some(wire) = extract_credential(&state, &headers) else {
        return unauthorized(&challenge, "Authentication required", redirect);
    };
    let Ok(token) = Token::parse(&wire) else {
        return unauthorized(&challenge, "Invalid token", redirect);
    };
    let data = match state.store.get(&token).await {
        Ok(Some(data)) => data,
        Ok(None) => return unauthorized(&challenge, "Invalid token", redirect),
        Err(e) => return ApiError::from(e).into_response(),
    };

    tracing::debug!(
        username = data.username.as_str(),
        original_uri = original_header(&headers, HEADER_ORIGINAL_URI),
        original_method = original_header(&headers, HEADER_ORIGINAL_METHOD),
        client = client_ip(&headers, &state.proxies).as_deref(),
        "auth subrequest"
    );

    if !satisfies(&data.scopes, &request.scopes, request.satisfy) {
        return forbidden(&request, "Token missing required scope");
    }
    if let Some(minimum) = request.minimum_lifetime
        && let Some(remaining) = data.remaining(Utc::now())
        && remaining.num_seconds() < minimum
    {
        return forbidden(&request, "Remaining token lifetime too short");
    }

    // The caller's own token is delivered unless delegation asks otherwise.
    let mut delivered = wire.clone();
    if request.notebook {
        match state.minter.notebook(&data).await {
            Ok(minted) => delivered = minted.token.encode(),
            Err(e) => return mint_error(&request, e),
        }
    } else if let Some(service) = &request.delegate_to {
        let scopes: BTreeSet<String> = request.delegate_scopes.iter().cloned().collect();
        match state.minter.internal(&data, service, &scopes).await {
            Ok(minted) => {
                if request.delegate_jwt {
                    match state.minter.issue_jwt(&minted) {
                        Ok(jwt) => delivered = jwt,
                        Err(e) => return ApiError::Internal(e).into_response(),
                    }
                } else {
                    delivered = minted.token.encode();
                }
            }
            Err(e) => return mint_error(&request, e),
        }
    }

    success(&request, &data, &delivered)
}

/// `GET /auth/analyze` - token introspection for operators.
///
/// Unlike `/auth`, a bad token here yields a diagnosis rather than a 401,
/// so a failing credential can be pasted in and examined.
pub async fn analyze_handler(
    Extension(state): Extension<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(wire) = extract_credential(&state, &headers) else {
        return Err(ApiError::InvalidCredentials);
    };
    let token = match Token::parse(&wire) {
        Ok(token) => token,
        Err(e) => {
            return Ok(Json(serde_json::json!({
                "valid": false,
                "reason": e.to_string(),
            })));
        }
    };
    match state.store.get(&token).await? {
        Some(data) => Ok(Json(serde_json::json!({
            "valid": true,
            "token": data.info(),
            "email": data.email,
        }))),
        None => Ok(Json(serde_json::json!({
            "valid": false,
            "reason": "token is unknown, revoked, or expired",
        }))),
    }
}

fn original_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Where to send an unauthenticated browser: back through `/login` with the
/// original URI as the return target. API callers (anything presenting an
/// `Authorization` header) get no redirect, just the challenge.
fn login_redirect(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if headers.contains_key(header::AUTHORIZATION) {
        return None;
    }
    let original = original_header(headers, HEADER_ORIGINAL_URI)?;
    let rd = format!("https://{}{}", state.settings.realm, original);
    Some(format!(
        "https://{}/login?rd={}",
        state.settings.realm,
        urlencoding::encode(&rd)
    ))
}

fn unauthorized(challenge: &str, msg: &str, redirect: Option<String>) -> Response {
    let body = error_body(msg, "invalid_credentials");
    let mut response = (StatusCode::UNAUTHORIZED, body.clone()).into_response();
    let headers = response.headers_mut();
    insert_header(headers, header::WWW_AUTHENTICATE.as_str(), challenge);
    insert_header(headers, HEADER_ERROR_STATUS, "401");
    insert_header(headers, HEADER_ERROR_BODY, &body);
    if let Some(location) = redirect {
        insert_header(headers, header::LOCATION.as_str(), &location);
    }
    set_json_content_type(headers);
    response
}

fn forbidden(request: &AuthRequest, msg: &str) -> Response {
    let body = error_body(msg, "insufficient_scope");
    let mut response = (StatusCode::FORBIDDEN, body.clone()).into_response();
    let headers = response.headers_mut();
    insert_header(headers, HEADER_ERROR_STATUS, "403");
    insert_header(headers, HEADER_ERROR_BODY, &body);
    insert_header(headers, HEADER_SCOPES_ACCEPTED, &request.scopes.join(" "));
    insert_header(headers, HEADER_SCOPES_SATISFY, request.satisfy.as_str());
    set_json_content_type(headers);
    response
}

fn mint_error(request: &AuthRequest, e: StoreError) -> Response {
    match e {
        StoreError::ChildScopes => {
            forbidden(request, "Delegated scopes exceed the token's scopes")
        }
        other => ApiError::from(other).into_response(),
    }
}

fn success(request: &AuthRequest, data: &TokenData, delivered: &str) -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    insert_header(headers, HEADER_AUTH_USER, &data.username);
    if let Some(email) = &data.email {
        insert_header(headers, HEADER_AUTH_EMAIL, email);
    }
    insert_header(headers, HEADER_AUTH_TOKEN, delivered);
    insert_header(
        headers,
        HEADER_AUTH_TOKEN_SCOPES,
        &data.scopes.iter().cloned().collect::<Vec<_>>().join(" "),
    );
    insert_header(headers, HEADER_SCOPES_ACCEPTED, &request.scopes.join(" "));
    insert_header(headers, HEADER_SCOPES_SATISFY, request.satisfy.as_str());
    response
}

fn error_body(msg: &str, kind: &str) -> String {
    serde_json::json!({"detail": [{"msg": msg, "type": kind}]}).to_string()
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        name.parse::<axum::http::HeaderName>(),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    } else {
        tracing::warn!("dropping unrepresentable header {}", name);
    }
}

fn set_json_content_type(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
}
