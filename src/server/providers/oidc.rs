//! Generic OpenID Connect identity provider.
//!
//! The callback exchanges the authorization code at the configured token
//! endpoint and verifies the returned ID token against the issuer, the
//! audience, and the provider's JWKS. The JWKS is discovered from the
//! issuer's well-known endpoint, cached in-process, and refreshed once when
//! an unknown key id shows up (key rotation).

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::OidcConfig;
use crate::server::providers::{Provider, ProviderError, UserInfo, get_json_with_retry};

pub struct OidcProvider {
    http: reqwest::Client,
    config: OidcConfig,
    client_secret: String,
    jwks: RwLock<Option<JwkSet>>,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    id_token: String,
}

#[derive(Debug, Deserialize)]
struct GroupMembership {
    name: String,
}

impl OidcProvider {
    pub fn new(config: OidcConfig, client_secret: String, http: reqwest::Client) -> Self {
        Self {
            http,
            config,
            client_secret,
            jwks: RwLock::new(None),
        }
    }

    /// Fetch the provider JWKS, via discovery, caching the result.
    async fn jwks(&self, force_refresh: bool) -> Result<JwkSet, ProviderError> {
        if !force_refresh
            && let Some(cached) = self.jwks.read().await.clone()
        {
            return Ok(cached);
        }

        let well_known = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer.trim_end_matches('/')
        );
        let discovery: serde_json::Value =
            get_json_with_retry(|| self.http.get(&well_known)).await?;
        let jwks_uri = discovery
            .get("jwks_uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::Protocol("discovery document has no jwks_uri".to_string())
            })?
            .to_string();
        let jwks: JwkSet = get_json_with_retry(|| self.http.get(&jwks_uri)).await?;

        *self.jwks.write().await = Some(jwks.clone());
        Ok(jwks)
    }

    /// Verify the ID token's signature and claims, returning the claim set.
    async fn verify_id_token(&self, id_token: &str) -> Result<serde_json::Value, ProviderError> {
        let header = decode_header(id_token)
            .map_err(|e| ProviderError::InvalidIdToken(format!("undecodable header: {}", e)))?;
        let kid = header.kid.ok_or_else(|| {
            ProviderError::InvalidIdToken("token header does not contain a key id".to_string())
        })?;

        let mut jwks = self.jwks(false).await?;
        if !jwks
            .keys
            .iter()
            .any(|k| k.common.key_id.as_deref() == Some(&kid))
        {
            // Unknown kid: the provider may have rotated keys since we
            // cached the JWKS.
            jwks = self.jwks(true).await?;
        }
        let jwk = jwks
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(&kid))
            .ok_or_else(|| {
                ProviderError::InvalidIdToken(format!("no matching JWK for key id {}", kid))
            })?;

        let decoding_key = DecodingKey::from_jwk(jwk)
            .map_err(|e| ProviderError::InvalidIdToken(format!("unusable JWK: {}", e)))?;
        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.config.audience]);
        validation.set_issuer(&[&self.config.issuer]);

        let token_data = decode::<serde_json::Value>(id_token, &decoding_key, &validation)
            .map_err(|e| ProviderError::InvalidIdToken(e.to_string()))?;
        Ok(token_data.claims)
    }
}

#[async_trait]
impl Provider for OidcProvider {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
            self.config.login_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_url),
            urlencoding::encode(&self.config.scopes.join(" ")),
            urlencoding::encode(state),
        );
        for (key, value) in &self.config.login_params {
            url.push('&');
            url.push_str(&urlencoding::encode(key));
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    async fn exchange(&self, code: &str) -> Result<UserInfo, ProviderError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ProviderError::Protocol(format!(
                "code exchange returned {}",
                response.status()
            )));
        }
        let token: TokenReply = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("undecodable token response: {}", e)))?;

        let claims = self.verify_id_token(&token.id_token).await?;

        let username = claims
            .get(&self.config.username_claim)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ProviderError::InvalidIdToken(format!(
                    "ID token has no {} claim",
                    self.config.username_claim
                ))
            })?
            .to_string();
        let name = claims
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let groups = match claims.get("isMemberOf") {
            Some(value) => {
                let memberships: Vec<GroupMembership> = serde_json::from_value(value.clone())
                    .map_err(|e| {
                        ProviderError::InvalidIdToken(format!("malformed isMemberOf claim: {}", e))
                    })?;
                memberships.into_iter().map(|m| m.name).collect()
            }
            None => Vec::new(),
        };

        tracing::debug!(
            "assembled OIDC identity for {} with {} groups",
            username,
            groups.len()
        );
        Ok(UserInfo {
            username,
            name,
            email,
            groups,
        })
    }
}
