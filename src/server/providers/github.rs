//! GitHub OAuth 2.0 identity provider.
//!
//! Identity assembly uses three REST calls after the code exchange: the
//! authenticated user, their email addresses (the primary wins), and their
//! team memberships. Each team becomes a group named `<org>-<team slug>`,
//! truncated to GitHub's 32-character limit.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GitHubConfig;
use crate::scopes::github_group;
use crate::server::providers::{Provider, ProviderError, UserInfo, get_json_with_retry};

/// OAuth scopes requested from GitHub: organization/team visibility plus
/// email addresses.
const GITHUB_OAUTH_SCOPES: &str = "read:org user:email";

pub struct GitHubProvider {
    http: reqwest::Client,
    config: GitHubConfig,
    client_secret: String,
    callback_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubTeam {
    slug: String,
    organization: GitHubOrg,
}

#[derive(Debug, Deserialize)]
struct GitHubOrg {
    login: String,
}

impl GitHubProvider {
    pub fn new(
        config: GitHubConfig,
        client_secret: String,
        realm: &str,
        http: reqwest::Client,
    ) -> Self {
        // GitHub redirects back to /login on the deployment host.
        let callback_url = format!("https://{}/login", realm);
        Self {
            http,
            config,
            client_secret,
            callback_url,
        }
    }

    async fn api_get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        access_token: &str,
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.config.api_url.trim_end_matches('/'), path);
        get_json_with_retry(|| {
            self.http
                .get(&url)
                .bearer_auth(access_token)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        })
        .await
    }
}

#[async_trait]
impl Provider for GitHubProvider {
    fn authorize_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&scope={}&state={}&redirect_uri={}",
            self.config.login_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(GITHUB_OAUTH_SCOPES),
            urlencoding::encode(state),
            urlencoding::encode(&self.callback_url),
        )
    }

    async fn exchange(&self, code: &str) -> Result<UserInfo, ProviderError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
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

        let user: GitHubUser = self.api_get("/user", &token.access_token).await?;
        let emails: Vec<GitHubEmail> = self
            .api_get("/user/emails", &token.access_token)
            .await?;
        let teams: Vec<GitHubTeam> = self
            .api_get("/user/teams?per_page=100", &token.access_token)
            .await?;

        let email = emails
            .iter()
            .find(|e| e.primary)
            .or_else(|| emails.first())
            .map(|e| e.email.clone())
            .or(user.email);
        let groups = teams
            .iter()
            .map(|team| github_group(&team.organization.login, &team.slug))
            .collect();

        tracing::debug!(
            "assembled GitHub identity for {} with {} teams",
            user.login,
            teams.len()
        );
        Ok(UserInfo {
            username: user.login,
            name: user.name,
            email,
            groups,
        })
    }
}
