//! Shared application state.
//!
//! All long-lived dependencies (database, cache, token store, minter,
//! upstream provider, signer) are built once at startup and threaded
//! explicitly through the handlers as one record. There are no global
//! singletons.

use ipnet::IpNet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::errors::StartupError;
use crate::sealing::Sealer;
use crate::server::constants::REQUEST_USER_AGENT;
use crate::server::persist::Database;
use crate::server::providers::{DynProvider, GitHubProvider, OidcProvider};
use crate::server::signing::{DynSigner, load_pem_signer_from_path};
use crate::token::Token;
use crate::token::cache::{MemoryTokenCache, RedisTokenCache, TokenCache};
use crate::token::minter::TokenMinter;
use crate::token::store::TokenStore;
use crate::utility::read_secret_file;

/// Long-lived dependencies shared by every request handler.
pub struct AppState {
    pub settings: Settings,
    pub db: Database,
    pub store: Arc<TokenStore>,
    pub minter: TokenMinter,
    pub provider: DynProvider,
    pub sealer: Sealer,
    pub signer: DynSigner,
    /// Parsed bootstrap token, if configured.
    pub bootstrap: Option<Token>,
    /// Trusted ingress proxy networks for client-IP extraction.
    pub proxies: Vec<IpNet>,
}

impl AppState {
    /// Build the dependency record from validated settings.
    pub async fn build(settings: Settings) -> Result<Arc<Self>, StartupError> {
        let session_secret = read_secret_file(&settings.session_secret_file)
            .map_err(|e| StartupError::Config(format!("{:#}", e)))?;
        let sealer = Sealer::from_base64(&session_secret)
            .map_err(|e| StartupError::Config(format!("session secret: {}", e)))?;

        let db_path = settings
            .database_path()
            .map_err(|e| StartupError::Config(e.to_string()))?;
        let db = Database::with_path(&db_path)
            .map_err(|e| StartupError::Database(format!("{:#}", e)))?;
        db.seed_admins(settings.initial_admins.clone())
            .await
            .map_err(|e| StartupError::Database(format!("seeding admins: {}", e)))?;

        let cache: Arc<dyn TokenCache> = match &settings.redis_url {
            Some(url) => {
                tracing::info!("Using redis token cache");
                Arc::new(
                    RedisTokenCache::connect(url)
                        .await
                        .map_err(|e| StartupError::Config(format!("{:#}", e)))?,
                )
            }
            None => {
                tracing::info!("No redis_url configured, using in-process token cache");
                Arc::new(MemoryTokenCache::new())
            }
        };

        let signer = load_pem_signer_from_path(
            &settings.issuer.key_file,
            Some(settings.issuer.key_id.as_str()),
        )
        .map_err(|e| StartupError::SigningMisconfigured(format!("{:#}", e)))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.provider_timeout_seconds))
            .user_agent(REQUEST_USER_AGENT)
            .build()
            .map_err(|e| StartupError::Config(format!("building HTTP client: {}", e)))?;

        let provider: DynProvider = if let Some(github) = &settings.github {
            let secret = read_secret_file(&github.client_secret_file)
                .map_err(|e| StartupError::Config(format!("{:#}", e)))?;
            tracing::info!("Using GitHub upstream provider");
            Arc::new(GitHubProvider::new(
                github.clone(),
                secret,
                &settings.realm,
                http.clone(),
            ))
        } else if let Some(oidc) = &settings.oidc {
            let secret = read_secret_file(&oidc.client_secret_file)
                .map_err(|e| StartupError::Config(format!("{:#}", e)))?;
            tracing::info!("Using OpenID Connect upstream provider {}", oidc.issuer);
            Arc::new(OidcProvider::new(oidc.clone(), secret, http.clone()))
        } else {
            // Settings validation enforces the provider XOR before this.
            unreachable!("settings validation guarantees a provider");
        };

        let store = Arc::new(TokenStore::new(db.clone(), cache.clone(), sealer.clone()));
        let minter = TokenMinter::new(
            store.clone(),
            cache.clone(),
            signer.clone(),
            settings.issuer.clone(),
        );

        let bootstrap = settings
            .bootstrap_token
            .as_deref()
            .map(|wire| Token::parse(wire).expect("bootstrap token validated at load time"));
        let proxies = settings.proxy_nets();

        Ok(Arc::new(AppState {
            settings,
            db,
            store,
            minter,
            provider,
            sealer,
            signer,
            bootstrap,
            proxies,
        }))
    }
}
