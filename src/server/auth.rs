//! Core authentication logic and data structures.
//!
//! This module provides credential extraction from requests, the scope
//! predicate used by the decision engine, resolution of API callers
//! (including the bootstrap token), and true-client-IP extraction behind
//! the configured ingress proxies.

use axum::http::{HeaderMap, header};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::errors::ApiError;
use crate::scopes::ADMIN_TOKEN_SCOPE;
use crate::server::constants::{BOOTSTRAP_USERNAME, HEADER_FORWARDED_FOR};
use crate::server::session::SessionCookie;
use crate::state::AppState;
use crate::token::{Token, TokenData};

/// How the required scopes combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Satisfy {
    #[default]
    All,
    Any,
}

impl Satisfy {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Satisfy::All),
            "any" => Some(Satisfy::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Satisfy::All => "all",
            Satisfy::Any => "any",
        }
    }
}

/// Which `WWW-Authenticate` challenge a 401 carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    Bearer,
    Basic,
}

impl AuthType {
    pub fn from_param(value: &str) -> Option<Self> {
        match value {
            "bearer" => Some(AuthType::Bearer),
            "basic" => Some(AuthType::Basic),
            _ => None,
        }
    }

    /// The challenge header value for the configured realm.
    pub fn challenge(&self, realm: &str) -> String {
        match self {
            AuthType::Bearer => format!("Bearer realm=\"{}\"", realm),
            AuthType::Basic => format!("Basic realm=\"{}\"", realm),
        }
    }
}

/// Evaluate the scope predicate.
pub fn satisfies(held: &BTreeSet<String>, required: &[String], satisfy: Satisfy) -> bool {
    if required.is_empty() {
        return true;
    }
    match satisfy {
        Satisfy::All => required.iter().all(|scope| held.contains(scope)),
        Satisfy::Any => required.iter().any(|scope| held.contains(scope)),
    }
}

/// Extract the presented wire token from a request.
///
/// Checked in order: `Authorization: Bearer`, `Authorization: Basic` with
/// the token as either the username or the password, then the session
/// cookie. Returns the raw wire string; parsing and validation are the
/// caller's job.
pub fn extract_credential(state: &AppState, headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
    {
        if let Some(bearer) = value.strip_prefix("Bearer ") {
            return Some(bearer.trim().to_string());
        }
        if let Some(encoded) = value.strip_prefix("Basic ")
            && let Ok(decoded) = BASE64_STANDARD.decode(encoded.trim())
            && let Ok(decoded) = String::from_utf8(decoded)
            && let Some((user, password)) = decoded.split_once(':')
        {
            // Either side of the Basic pair may carry the token.
            if Token::parse(user).is_ok() {
                return Some(user.to_string());
            }
            return Some(password.to_string());
        }
    }

    SessionCookie::from_headers(headers, &state.sealer, state.settings.token_lifetime())
        .and_then(|session| session.token)
}

/// A caller resolved for the token API: a normal token, or the bootstrap
/// token acting as a fixed-identity super-admin.
pub enum ApiCaller {
    Token(TokenData),
    Bootstrap,
}

impl ApiCaller {
    pub fn username(&self) -> &str {
        match self {
            ApiCaller::Token(data) => &data.username,
            ApiCaller::Bootstrap => BOOTSTRAP_USERNAME,
        }
    }

    pub fn is_bootstrap(&self) -> bool {
        matches!(self, ApiCaller::Bootstrap)
    }

    /// Whether the caller may operate on any owner's tokens.
    pub fn is_admin(&self) -> bool {
        match self {
            ApiCaller::Token(data) => data.scopes.contains(ADMIN_TOKEN_SCOPE),
            ApiCaller::Bootstrap => true,
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        match self {
            ApiCaller::Token(data) => data.scopes.contains(scope),
            ApiCaller::Bootstrap => true,
        }
    }
}

/// Resolve the caller of a JSON API request.
///
/// The bootstrap token is checked by constant-time comparison before the
/// store is consulted; it resolves to the fixed `<bootstrap>` identity.
pub async fn authenticate_api(state: &AppState, headers: &HeaderMap) -> Result<ApiCaller, ApiError> {
    let wire = extract_credential(state, headers).ok_or(ApiError::InvalidCredentials)?;
    let token = Token::parse(&wire).map_err(|e| ApiError::MalformedToken(e.to_string()))?;
    if let Some(bootstrap) = &state.bootstrap
        && token.ct_eq_wire(bootstrap)
    {
        return Ok(ApiCaller::Bootstrap);
    }
    let data = state
        .store
        .get(&token)
        .await
        .map_err(ApiError::from)?
        .ok_or(ApiError::InvalidCredentials)?;
    Ok(ApiCaller::Token(data))
}

/// Pick the true client address out of `X-Forwarded-For`.
///
/// Addresses are scanned right to left; the first one outside the trusted
/// proxy CIDRs is the client. When every hop is a trusted proxy the
/// leftmost address wins.
pub fn client_ip(headers: &HeaderMap, proxies: &[IpNet]) -> Option<String> {
    let forwarded = headers.get(HEADER_FORWARDED_FOR)?.to_str().ok()?;
    let addresses: Vec<IpAddr> = forwarded
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    for address in addresses.iter().rev() {
        if !proxies.iter().any(|net| net.contains(address)) {
            return Some(address.to_string());
        }
    }
    addresses.first().map(|address| address.to_string())
}
