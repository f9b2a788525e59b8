//! Upstream identity providers.
//!
//! A deployment authenticates against exactly one provider: GitHub OAuth
//! 2.0 or a generic OpenID Connect issuer. Both implement [`Provider`]: the
//! login handler asks for the authorization redirect, and the callback
//! handler exchanges the authorization code for an assembled identity. All
//! provider-specific wire formats stay inside this module.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod github;
pub mod oidc;

pub use github::GitHubProvider;
pub use oidc::OidcProvider;

/// Errors talking to or interpreting an upstream provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error("ID token rejected: {0}")]
    InvalidIdToken(String),
}

impl ProviderError {
    /// Client-safe summary; the full cause only goes to the log.
    pub fn sanitized(&self) -> String {
        match self {
            ProviderError::Http(_) => "upstream identity provider unreachable".to_string(),
            ProviderError::Protocol(_) => {
                "upstream identity provider returned an unexpected response".to_string()
            }
            ProviderError::InvalidIdToken(_) => {
                "identity token from the provider could not be verified".to_string()
            }
        }
    }
}

/// Identity assembled from a provider after a successful code exchange.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub username: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Provider group names, as consumed by the scope engine.
    pub groups: Vec<String>,
}

/// One configured upstream provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The provider authorization URL to redirect the browser to, carrying
    /// the CSRF state.
    fn authorize_url(&self, state: &str) -> String;

    /// Exchange an authorization code for the caller's identity.
    async fn exchange(&self, code: &str) -> Result<UserInfo, ProviderError>;
}

pub type DynProvider = Arc<dyn Provider>;

/// Issue an idempotent GET, retrying transient failures with bounded
/// exponential backoff. Non-idempotent calls (the code exchange) go out
/// exactly once.
pub(crate) async fn get_json_with_retry<T, F>(build: F) -> Result<T, ProviderError>
where
    T: DeserializeOwned,
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut delay = Duration::from_millis(250);
    let mut attempt = 0u32;
    loop {
        let result = build().send().await;
        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.json::<T>().await.map_err(|e| {
                        ProviderError::Protocol(format!("undecodable response body: {}", e))
                    });
                }
                if status.is_server_error() && attempt < 2 {
                    tracing::debug!("provider returned {}, retrying", status);
                } else {
                    return Err(ProviderError::Protocol(format!(
                        "unexpected status {}",
                        status
                    )));
                }
            }
            Err(e) if (e.is_timeout() || e.is_connect()) && attempt < 2 => {
                tracing::debug!("provider request failed ({}), retrying", e);
            }
            Err(e) => return Err(ProviderError::Http(e)),
        }
        attempt += 1;
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
}
