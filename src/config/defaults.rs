/// Gafaelfawr configuration defaults module.
///
/// Default value helpers for serde deserialization in the settings structs.
/// Keeping them here gives `mod.rs` and `components.rs` one consistent
/// source of defaults.

/// Default HTTP bind address.
pub(crate) fn default_bind_address() -> String {
    crate::server::constants::DEFAULT_BIND_ADDRESS.to_string()
}

/// Default session token lifetime (one day).
pub(crate) fn default_token_lifetime_minutes() -> i64 {
    60 * 24
}

/// Default hard timeout for upstream provider calls.
pub(crate) fn default_provider_timeout_seconds() -> u64 {
    10
}

/// Default lifetime of issued internal JWTs.
pub(crate) fn default_issuer_exp_minutes() -> i64 {
    15
}

/// Default GitHub authorization endpoint.
pub(crate) fn default_github_login_url() -> String {
    "https://github.com/login/oauth/authorize".to_string()
}

/// Default GitHub token endpoint.
pub(crate) fn default_github_token_url() -> String {
    "https://github.com/login/oauth/access_token".to_string()
}

/// Default GitHub REST API base.
pub(crate) fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

/// Default OAuth scopes requested from an OIDC provider.
pub(crate) fn default_oidc_scopes() -> Vec<String> {
    vec!["openid".to_string()]
}

/// Default ID-token claim carrying the username.
pub(crate) fn default_username_claim() -> String {
    "sub".to_string()
}
