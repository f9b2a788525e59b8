//! On-demand minting of notebook and internal tokens.
//!
//! Delegated child tokens are deduplicated across requests through the
//! cache: one live child per (parent, service, scope set) fingerprint.
//! Concurrent requests for the same fingerprint are single-flighted with a
//! short-lived cache lock; losers poll until the winner's token appears.
//! Internal tokens can additionally be rendered as signed RS256 JWT
//! envelopes, which are derived on demand and never persisted.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IssuerConfig;
use crate::server::signing::DynSigner;
use crate::token::cache::TokenCache;
use crate::token::store::{
    CreateToken, INTERNAL_ACTOR, StoreError, TokenStore, internal_cache_key, notebook_cache_key,
};
use crate::token::{Token, TokenData, TokenKind, mint_fingerprint};

/// Lifetime of a freshly minted child token.
const CHILD_TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// A child below this margin of remaining life is re-minted rather than
/// reused, so downstream calls never race its expiration.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// How long a mint lock may be held before it is presumed dead.
const MINT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Poll interval for callers that lost the mint race.
const MINT_WAIT: Duration = Duration::from_millis(100);

const MINT_ATTEMPTS: usize = 50;

/// Mints notebook and internal tokens and their JWT envelopes.
pub struct TokenMinter {
    store: Arc<TokenStore>,
    cache: Arc<dyn TokenCache>,
    signer: DynSigner,
    issuer: IssuerConfig,
}

impl TokenMinter {
    pub fn new(
        store: Arc<TokenStore>,
        cache: Arc<dyn TokenCache>,
        signer: DynSigner,
        issuer: IssuerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            signer,
            issuer,
        }
    }

    /// Mint (or return the cached live) internal token for a downstream
    /// service. `scopes` must be a subset of the parent's scopes.
    pub async fn internal(
        &self,
        parent: &TokenData,
        service: &str,
        scopes: &BTreeSet<String>,
    ) -> Result<TokenData, StoreError> {
        let fingerprint = mint_fingerprint(parent.token.key(), Some(service), scopes);
        self.mint_child(
            parent,
            TokenKind::Internal,
            scopes.clone(),
            internal_cache_key(&fingerprint),
        )
        .await
    }

    /// Mint (or return the cached live) notebook token, carrying the
    /// parent's full scope set.
    pub async fn notebook(&self, parent: &TokenData) -> Result<TokenData, StoreError> {
        self.mint_child(
            parent,
            TokenKind::Notebook,
            parent.scopes.clone(),
            notebook_cache_key(parent.token.key()),
        )
        .await
    }

    /// Sign the RS256 JWT envelope for a minted internal token.
    ///
    /// The underlying token is the authoritative record; the JWT is a
    /// derivable envelope and is never stored.
    pub fn issue_jwt(&self, data: &TokenData) -> anyhow::Result<String> {
        let now = Utc::now();
        let exp = data
            .expires
            .unwrap_or_else(|| now + ChronoDuration::minutes(self.issuer.exp_minutes));
        let scope = data.scopes.iter().cloned().collect::<Vec<_>>().join(" ");
        let claims = serde_json::json!({
            "iss": self.issuer.iss,
            "aud": self.issuer.aud.internal,
            "sub": data.username,
            "scope": scope,
            "jti": data.token.key(),
            "iat": now.timestamp(),
            "exp": exp.timestamp(),
            "iss_key_id": self.signer.kid(),
        });
        let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
        self.signer.sign(header, &claims)
    }

    async fn mint_child(
        &self,
        parent: &TokenData,
        kind: TokenKind,
        scopes: BTreeSet<String>,
        cache_key: String,
    ) -> Result<TokenData, StoreError> {
        if !scopes.is_subset(&parent.scopes) {
            return Err(StoreError::ChildScopes);
        }
        let lock_key = format!("{}:lock", cache_key);

        for _ in 0..MINT_ATTEMPTS {
            if let Some(existing) = self.cached_live(&cache_key).await {
                return Ok(existing);
            }
            match self.cache.lock(&lock_key, MINT_LOCK_TTL).await {
                Ok(true) => {
                    // Double-check after winning: the previous holder may
                    // have finished between our read and the lock.
                    let result = match self.cached_live(&cache_key).await {
                        Some(existing) => Ok(existing),
                        None => self.mint_new(parent, kind, &scopes, &cache_key).await,
                    };
                    let _ = self.cache.unlock(&lock_key).await;
                    return result;
                }
                Ok(false) => tokio::time::sleep(MINT_WAIT).await,
                Err(e) => {
                    // A broken cache must not take minting down with it.
                    tracing::warn!("mint lock unavailable, minting directly: {:#}", e);
                    return self.mint_new(parent, kind, &scopes, &cache_key).await;
                }
            }
        }
        tracing::warn!("mint lock for {} wedged, minting directly", cache_key);
        self.mint_new(parent, kind, &scopes, &cache_key).await
    }

    async fn mint_new(
        &self,
        parent: &TokenData,
        kind: TokenKind,
        scopes: &BTreeSet<String>,
        cache_key: &str,
    ) -> Result<TokenData, StoreError> {
        let now = Utc::now();
        let expires = child_expiry(parent, now)?;
        let request = CreateToken {
            username: parent.username.clone(),
            kind,
            scopes: scopes.clone(),
            expires: Some(expires),
            token_name: None,
            parent: Some(parent.token.key().to_string()),
            email: parent.email.clone(),
        };
        let data = self
            .store
            .create(request, Some(parent), INTERNAL_ACTOR, None)
            .await?;

        let ttl = (expires - now).num_seconds() - SAFETY_MARGIN.as_secs() as i64;
        if ttl > 0 {
            let wire = data.token.encode();
            if let Err(e) = self
                .cache
                .set(cache_key, wire.as_bytes(), Duration::from_secs(ttl as u64))
                .await
            {
                tracing::warn!("could not cache minted token {}: {:#}", cache_key, e);
            }
        }
        Ok(data)
    }

    /// Read a cached wire token and validate it against the store; entries
    /// under the safety margin are ignored so they get re-minted.
    async fn cached_live(&self, cache_key: &str) -> Option<TokenData> {
        let blob = match self.cache.get(cache_key).await {
            Ok(blob) => blob?,
            Err(e) => {
                tracing::warn!("mint cache read failed: {:#}", e);
                return None;
            }
        };
        let wire = String::from_utf8(blob).ok()?;
        let token = Token::parse(&wire).ok()?;
        let data = self.store.get(&token).await.ok().flatten()?;
        let remaining = data.remaining(Utc::now())?;
        if remaining.num_seconds() > SAFETY_MARGIN.as_secs() as i64 {
            Some(data)
        } else {
            None
        }
    }
}

/// Expiry for a new child: fifteen minutes out, clamped to the parent's
/// expiry minus the safety margin. A parent already inside the margin
/// cannot delegate.
fn child_expiry(parent: &TokenData, now: DateTime<Utc>) -> Result<DateTime<Utc>, StoreError> {
    let mut expires = now + ChronoDuration::from_std(CHILD_TOKEN_LIFETIME).expect("fits chrono");
    if let Some(parent_expires) = parent.expires {
        let bound = parent_expires - ChronoDuration::from_std(SAFETY_MARGIN).expect("fits chrono");
        expires = expires.min(bound);
    }
    if expires <= now {
        return Err(StoreError::Expired);
    }
    Ok(expires)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent_with_expiry(expires: Option<DateTime<Utc>>) -> TokenData {
        TokenData {
            token: Token::generate(),
            username: "alice".to_string(),
            kind: TokenKind::Session,
            scopes: BTreeSet::new(),
            created: Utc::now(),
            expires,
            token_name: None,
            parent: None,
            email: None,
        }
    }

    #[test]
    fn child_expiry_defaults_to_fifteen_minutes() {
        let now = Utc::now();
        let parent = parent_with_expiry(None);
        let expires = child_expiry(&parent, now).expect("expiry");
        assert_eq!((expires - now).num_seconds(), 15 * 60);
    }

    #[test]
    fn child_expiry_is_clamped_below_parent() {
        let now = Utc::now();
        let parent = parent_with_expiry(Some(now + ChronoDuration::minutes(10)));
        let expires = child_expiry(&parent, now).expect("expiry");
        assert_eq!((expires - now).num_seconds(), 5 * 60);
    }

    #[test]
    fn parent_inside_margin_cannot_delegate() {
        let now = Utc::now();
        let parent = parent_with_expiry(Some(now + ChronoDuration::minutes(4)));
        assert!(matches!(
            child_expiry(&parent, now),
            Err(StoreError::Expired)
        ));
    }
}
