/**
 * Gafaelfawr configuration root module.
 *
 * - Defines the root settings struct (`Settings`) and its defaults.
 * - Provides settings file loading, env override logic, and error reporting.
 * - Uses `components.rs` for sub-structures and `defaults.rs` for default
 *   helpers.
 */
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::scopes::{ADMIN_TOKEN_SCOPE, USER_TOKEN_SCOPE};

pub mod components;
pub mod defaults;

pub use components::{AudienceConfig, GitHubConfig, IssuerConfig, OidcConfig};

/// Root settings for the Gafaelfawr server, loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Hostname of the deployment, used as the authentication realm and for
    /// return-URL validation.
    pub realm: String,

    /// Address and port the HTTP server binds.
    #[serde(default = "defaults::default_bind_address")]
    pub bind_address: String,

    /// File containing the base64-encoded 256-bit session key used to seal
    /// cookies and cached token records.
    pub session_secret_file: PathBuf,

    /// SQL database URL (`sqlite:///path` or a bare filesystem path).
    pub database_url: String,

    /// Redis URL for the token cache. When absent, an in-process cache is
    /// used instead; Redis is required for multi-replica deployments.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Where the browser is sent after logout.
    pub after_logout_url: String,

    /// CIDR blocks of trusted ingress proxies, used to pick the true client
    /// address out of `X-Forwarded-For`.
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Usernames seeded into the admin table on first startup.
    #[serde(default)]
    pub initial_admins: Vec<String>,

    /// Optional super-admin token in wire form, honored only on the token
    /// and admin routes.
    #[serde(default)]
    pub bootstrap_token: Option<String>,

    /// Every scope this deployment recognizes, with a human description.
    pub known_scopes: BTreeMap<String, String>,

    /// Declarative scope -> group-name mapping driving scope derivation.
    #[serde(default)]
    pub group_mapping: BTreeMap<String, Vec<String>>,

    /// Session token lifetime in minutes.
    #[serde(default = "defaults::default_token_lifetime_minutes")]
    pub token_lifetime_minutes: i64,

    /// Hard timeout for each upstream provider call, in seconds.
    #[serde(default = "defaults::default_provider_timeout_seconds")]
    pub provider_timeout_seconds: u64,

    /// Issuer settings for internal JWTs.
    pub issuer: IssuerConfig,

    /// GitHub OAuth upstream. Mutually exclusive with `oidc`.
    #[serde(default)]
    pub github: Option<GitHubConfig>,

    /// Generic OpenID Connect upstream. Mutually exclusive with `github`.
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
}

impl Settings {
    /// Compute the default settings file path, honoring the
    /// `GAFAELFAWR_SETTINGS_PATH` environment variable.
    pub fn default_path() -> PathBuf {
        if let Some(override_path) = std::env::var_os("GAFAELFAWR_SETTINGS_PATH") {
            return PathBuf::from(override_path);
        }
        PathBuf::from("/etc/gafaelfawr/gafaelfawr.yaml")
    }

    /// Load settings from the given path (or the default path) and validate
    /// them. There is no default configuration: a missing or invalid file is
    /// fatal.
    pub fn load(settings_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = settings_path.unwrap_or_else(Self::default_path);
        tracing::debug!("Reading settings from {:?}", path);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Parse(path.clone(), format!("I/O error: {}", e)))?;
        let settings = Self::parse_yaml_with_path(&path, &text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse YAML settings with line/column information in error messages.
    fn parse_yaml_with_path(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str::<Self>(text).map_err(|e| {
            let msg = if let Some(loc) = e.location() {
                format!(
                    "yaml error at line {}, column {}: {}",
                    loc.line(),
                    loc.column(),
                    e
                )
            } else {
                format!("yaml error: {}", e)
            };
            ConfigError::Parse(path.to_path_buf(), msg)
        })
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.github, &self.oidc) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "github and oidc are mutually exclusive; configure exactly one".into(),
                ));
            }
            (None, None) => {
                return Err(ConfigError::Invalid(
                    "no upstream provider configured; one of github or oidc is required".into(),
                ));
            }
            _ => {}
        }

        for synthetic in [USER_TOKEN_SCOPE, ADMIN_TOKEN_SCOPE] {
            if !self.known_scopes.contains_key(synthetic) {
                return Err(ConfigError::Invalid(format!(
                    "known_scopes must include the synthetic scope {}",
                    synthetic
                )));
            }
        }

        for scope in self.group_mapping.keys() {
            if !self.known_scopes.contains_key(scope) {
                return Err(ConfigError::Invalid(format!(
                    "group_mapping refers to unknown scope {}",
                    scope
                )));
            }
        }

        for cidr in &self.proxies {
            cidr.parse::<ipnet::IpNet>().map_err(|e| {
                ConfigError::Invalid(format!("invalid proxy CIDR {}: {}", cidr, e))
            })?;
        }

        if self.token_lifetime_minutes <= 0 {
            return Err(ConfigError::Invalid(
                "token_lifetime_minutes must be positive".into(),
            ));
        }

        if let Some(wire) = &self.bootstrap_token
            && crate::token::Token::parse(wire).is_err()
        {
            return Err(ConfigError::Invalid(
                "bootstrap_token is not a valid token".into(),
            ));
        }

        self.database_path()?;
        Ok(())
    }

    /// Resolve `database_url` to a SQLite file path.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = self.database_url.strip_prefix("sqlite://") {
            // Accept both sqlite:///abs/path and sqlite://relative.
            let trimmed = path.strip_prefix('/').map_or(path, |rest| {
                if rest.starts_with('/') { rest } else { path }
            });
            return Ok(PathBuf::from(trimmed));
        }
        if self.database_url.contains("://") {
            return Err(ConfigError::Invalid(format!(
                "unsupported database_url {}; expected sqlite:// or a file path",
                self.database_url
            )));
        }
        Ok(PathBuf::from(&self.database_url))
    }

    /// Session token lifetime as a [`Duration`].
    pub fn token_lifetime(&self) -> Duration {
        Duration::from_secs(self.token_lifetime_minutes as u64 * 60)
    }

    /// Parsed trusted-proxy CIDR list. Validated at load time.
    pub fn proxy_nets(&self) -> Vec<ipnet::IpNet> {
        self.proxies
            .iter()
            .filter_map(|cidr| cidr.parse().ok())
            .collect()
    }
}

/// Errors during settings loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse {0}: {1}")]
    Parse(PathBuf, String),

    #[error("invalid settings: {0}")]
    Invalid(String),
}
