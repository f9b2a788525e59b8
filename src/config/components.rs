/// Gafaelfawr configuration components module.
///
/// This module defines the sub-structures referenced from the root
/// `Settings` in `mod.rs`: the internal-token issuer and the two upstream
/// provider configurations.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::defaults;

/// Issuer settings for internal RS256 JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// `iss` claim on every issued JWT.
    pub iss: String,

    /// Audiences for issued JWTs.
    pub aud: AudienceConfig,

    /// `kid` advertised in the JWKS and JWT headers. When empty, a key id is
    /// derived from the public key material.
    #[serde(default)]
    pub key_id: String,

    /// PEM file holding the RSA private signing key.
    pub key_file: PathBuf,

    /// Lifetime of issued JWTs in minutes.
    #[serde(default = "defaults::default_issuer_exp_minutes")]
    pub exp_minutes: i64,
}

/// Audience values for issued JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudienceConfig {
    /// Audience for tokens handed to browsers and external callers.
    pub default: String,
    /// Audience for internal JWTs consumed by services behind the ingress.
    pub internal: String,
}

/// GitHub OAuth 2.0 upstream provider settings.
///
/// The endpoint URLs default to github.com and exist as settings so tests
/// and GitHub Enterprise deployments can point elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    pub client_id: String,
    pub client_secret_file: PathBuf,

    #[serde(default = "defaults::default_github_login_url")]
    pub login_url: String,

    #[serde(default = "defaults::default_github_token_url")]
    pub token_url: String,

    /// Base URL of the GitHub REST API.
    #[serde(default = "defaults::default_github_api_url")]
    pub api_url: String,
}

/// Generic OpenID Connect upstream provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret_file: PathBuf,

    /// Provider authorization endpoint the browser is redirected to.
    pub login_url: String,

    /// Provider token endpoint for the code exchange.
    pub token_url: String,

    /// Registered callback URL for this deployment.
    pub redirect_url: String,

    /// OAuth scopes requested at login.
    #[serde(default = "defaults::default_oidc_scopes")]
    pub scopes: Vec<String>,

    /// Expected `iss` of ID tokens; also the base for JWKS discovery.
    pub issuer: String,

    /// Expected `aud` of ID tokens.
    pub audience: String,

    /// Claim carrying the username. Defaults to the standard subject claim.
    #[serde(default = "defaults::default_username_claim")]
    pub username_claim: String,

    /// Extra query parameters appended to the authorization redirect.
    #[serde(default)]
    pub login_params: BTreeMap<String, String>,
}
