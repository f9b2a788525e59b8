//! Two-tier token store and lifecycle manager.
//!
//! SQL is the source of truth for enumeration, ownership, and history; the
//! key-value cache is authoritative for the authentication fast path. Every
//! mutation takes the canonical sequence: history row and mutation committed
//! in one SQL transaction, then the cache entry evicted or overwritten. A
//! crash between commit and eviction leaves a stale cache entry bounded by
//! its TTL, which never exceeds the token's own remaining lifetime.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::sealing::Sealer;
use crate::server::persist::{
    Database, HistoryAction, HistoryEntry, PersistError, TokenRow, TokenRowUpdate,
};
use crate::token::{Token, TokenData, TokenInfo, TokenKind};

/// TTL ceiling for cached authentication records.
pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(300);

/// Actor recorded in history rows for server-initiated changes.
pub const INTERNAL_ACTOR: &str = "<internal>";

/// Errors from the token store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("token name already in use")]
    DuplicateTokenName,

    #[error("token not found")]
    NotFound,

    #[error("child token scopes exceed parent scopes")]
    ChildScopes,

    #[error("token has expired")]
    Expired,

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<PersistError> for StoreError {
    fn from(e: PersistError) -> Self {
        match e {
            PersistError::Duplicate => StoreError::DuplicateTokenName,
            PersistError::Backend(e) => StoreError::Backend(e),
        }
    }
}

/// Request to create a token. Parent invariants are validated against the
/// parent's full record, which the caller must supply for child kinds.
#[derive(Debug, Clone)]
pub struct CreateToken {
    pub username: String,
    pub kind: TokenKind,
    pub scopes: BTreeSet<String>,
    pub expires: Option<DateTime<Utc>>,
    pub token_name: Option<String>,
    pub parent: Option<String>,
    pub email: Option<String>,
}

/// Fields of a token that may change after creation.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub scopes: Option<BTreeSet<String>>,
    pub token_name: Option<Option<String>>,
    pub expires: Option<Option<DateTime<Utc>>>,
}

impl TokenUpdate {
    pub fn is_empty(&self) -> bool {
        self.scopes.is_none() && self.token_name.is_none() && self.expires.is_none()
    }
}

/// One cross-layer drift finding from [`TokenStore::audit`].
#[derive(Debug, Clone, Serialize)]
pub struct Inconsistency {
    pub token_key: String,
    pub problem: String,
}

/// The two-tier token store.
pub struct TokenStore {
    db: Database,
    cache: Arc<dyn crate::token::cache::TokenCache>,
    sealer: Sealer,
}

impl TokenStore {
    pub fn new(
        db: Database,
        cache: Arc<dyn crate::token::cache::TokenCache>,
        sealer: Sealer,
    ) -> Self {
        Self { db, cache, sealer }
    }

    /// Allocate and persist a new token.
    ///
    /// When `parent` is supplied, the child-scope invariant is enforced
    /// here; the expiry bound is the minter's responsibility since it knows
    /// the safety margin it wants.
    pub async fn create(
        &self,
        request: CreateToken,
        parent: Option<&TokenData>,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<TokenData, StoreError> {
        assert_eq!(
            request.kind.is_child(),
            request.parent.is_some(),
            "child token kinds require a parent and vice versa"
        );
        if request.kind == TokenKind::User {
            if request.token_name.is_none() {
                return Err(StoreError::Invalid("user tokens require a name".into()));
            }
        } else if request.token_name.is_some() {
            return Err(StoreError::Invalid(format!(
                "{} tokens cannot have a name",
                request.kind.as_str()
            )));
        }
        if let Some(parent_data) = parent {
            if !request.scopes.is_subset(&parent_data.scopes) {
                return Err(StoreError::ChildScopes);
            }
            if let Some(parent_expires) = parent_data.expires {
                let child_expires = request
                    .expires
                    .expect("child tokens of an expiring parent must themselves expire");
                assert!(
                    child_expires <= parent_expires,
                    "child token expiry exceeds parent expiry"
                );
            }
        }

        let token = Token::generate();
        let row = TokenRow {
            key: token.key().to_string(),
            hash: token.hash_secret(),
            username: request.username.clone(),
            kind: request.kind,
            token_name: request.token_name.clone(),
            scopes: request.scopes.clone(),
            created: Utc::now(),
            expires: request.expires,
            parent: request.parent.clone(),
        };
        let history = HistoryEntry::new(&row.key, actor, HistoryAction::Create, ip)
            .with_after(row.mutable_fields());
        self.db.insert_token(row.clone(), history).await?;
        tracing::debug!(
            "created {} token {} for {}",
            request.kind.as_str(),
            row.key,
            request.username
        );

        let data = TokenData {
            token,
            username: row.username,
            kind: row.kind,
            scopes: row.scopes,
            created: row.created,
            expires: row.expires,
            token_name: row.token_name,
            parent: row.parent,
            email: request.email,
        };
        // Warm the cache so the first auth subrequest does not read through.
        if let Err(e) = self.cache_store(&data).await {
            tracing::warn!("could not warm token cache for {}: {:#}", data.token.key(), e);
        }
        Ok(data)
    }

    /// Resolve a presented wire token to its record.
    ///
    /// Cache first, SQL second; a SQL hit repopulates the cache with a TTL
    /// bounded by the remaining lifetime. The secret is verified by
    /// constant-time comparison in both paths. Unknown, expired, and
    /// secret-mismatched tokens all resolve to `None`.
    pub async fn get(&self, token: &Token) -> Result<Option<TokenData>, StoreError> {
        let now = Utc::now();
        let cache_key = token_cache_key(token.key());

        match self.cache.get(&cache_key).await {
            Ok(Some(blob)) => {
                if let Some(data) = self.decode_cached(&blob) {
                    if !constant_time_wire_eq(&data.token, token) {
                        return Ok(None);
                    }
                    if data.is_expired(now) {
                        let _ = self.cache.delete(&cache_key).await;
                        return Ok(None);
                    }
                    return Ok(Some(data));
                }
                // Undecodable cache entries are dropped and resolved from
                // SQL on this same request.
                let _ = self.cache.delete(&cache_key).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("token cache read failed, falling back to SQL: {:#}", e);
            }
        }

        let Some(row) = self.db.get_token(token.key().to_string()).await? else {
            return Ok(None);
        };
        if !token.verify_hash(&row.hash) {
            tracing::debug!("secret mismatch for token {}", token.key());
            return Ok(None);
        }
        if row.is_expired(now) {
            return Ok(None);
        }
        let data = data_from_row(row, token.clone());
        if let Err(e) = self.cache_store(&data).await {
            tracing::warn!(
                "could not repopulate token cache for {}: {:#}",
                data.token.key(),
                e
            );
        }
        Ok(Some(data))
    }

    /// Public projection of a token by key. Permission checks are the
    /// caller's responsibility.
    pub async fn get_info(&self, key: &str) -> Result<Option<TokenInfo>, StoreError> {
        let row = self.db.get_token(key.to_string()).await?;
        Ok(row.map(info_from_row))
    }

    pub async fn list(&self, username: Option<&str>) -> Result<Vec<TokenInfo>, StoreError> {
        let rows = self.db.list_tokens(username.map(|u| u.to_string())).await?;
        Ok(rows.into_iter().map(info_from_row).collect())
    }

    /// Modify the mutable fields of a token. The cache entry is invalidated
    /// before the call returns.
    pub async fn modify(
        &self,
        key: &str,
        update: TokenUpdate,
        actor: &str,
        ip: Option<&str>,
    ) -> Result<TokenInfo, StoreError> {
        let Some(current) = self.db.get_token(key.to_string()).await? else {
            return Err(StoreError::NotFound);
        };
        if let Some(name_update) = &update.token_name {
            if current.kind != TokenKind::User {
                return Err(StoreError::Invalid(format!(
                    "{} tokens cannot be renamed",
                    current.kind.as_str()
                )));
            }
            if name_update.is_none() {
                return Err(StoreError::Invalid("user tokens require a name".into()));
            }
        }

        let row_update = TokenRowUpdate {
            scopes: update.scopes,
            token_name: update.token_name,
            expires: update.expires,
        };
        let updated = self
            .db
            .update_token(
                key.to_string(),
                row_update,
                actor.to_string(),
                ip.map(|ip| ip.to_string()),
            )
            .await?
            .ok_or(StoreError::NotFound)?;

        self.cache
            .delete(&token_cache_key(key))
            .await
            .map_err(StoreError::Backend)?;
        Ok(info_from_row(updated))
    }

    /// Revoke a token and every transitive descendant.
    ///
    /// Cache entries are evicted before the SQL rows are deleted so no live
    /// cache entry can outlive its row; the deletions themselves, and one
    /// `revoke` history entry per token, commit in a single transaction.
    pub async fn revoke(&self, key: &str, actor: &str, ip: Option<&str>) -> Result<bool, StoreError> {
        if self.db.get_token(key.to_string()).await?.is_none() {
            return Ok(false);
        }

        let mut keys = vec![key.to_string()];
        keys.extend(self.db.descendants_of(key.to_string()).await?);

        for revoked in &keys {
            self.cache
                .delete(&token_cache_key(revoked))
                .await
                .map_err(StoreError::Backend)?;
            self.cache
                .delete(&notebook_cache_key(revoked))
                .await
                .map_err(StoreError::Backend)?;
        }

        let entries = keys
            .iter()
            .map(|k| HistoryEntry::new(k, actor, HistoryAction::Revoke, ip))
            .collect();
        let deleted = self.db.delete_tokens(entries).await?;
        tracing::info!(
            "revoked token {} and {} descendants (actor {})",
            key,
            deleted.saturating_sub(1),
            actor
        );
        Ok(true)
    }

    /// Delete expired tokens, writing `expire` history rows. Children expire
    /// no later than their parents, so no cascade is needed.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let rows = self.db.expired_tokens(now.timestamp()).await?;
        if rows.is_empty() {
            return Ok(0);
        }
        for row in &rows {
            self.cache
                .delete(&token_cache_key(&row.key))
                .await
                .map_err(StoreError::Backend)?;
            self.cache
                .delete(&notebook_cache_key(&row.key))
                .await
                .map_err(StoreError::Backend)?;
        }
        let entries = rows
            .iter()
            .map(|row| {
                HistoryEntry::new(&row.key, INTERNAL_ACTOR, HistoryAction::Expire, None)
                    .with_before(row.mutable_fields())
            })
            .collect();
        let deleted = self.db.delete_tokens(entries).await?;
        tracing::info!("expired {} tokens", deleted);
        Ok(deleted)
    }

    pub async fn history(&self, key: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.db.history_for(key.to_string()).await?)
    }

    /// Scan both layers and report drift.
    pub async fn audit(&self) -> Result<Vec<Inconsistency>, StoreError> {
        let now = Utc::now();
        let rows = self.db.list_tokens(None).await?;
        let by_key: HashMap<&str, &TokenRow> =
            rows.iter().map(|row| (row.key.as_str(), row)).collect();
        let mut findings = Vec::new();

        for row in &rows {
            if row.is_expired(now) {
                findings.push(Inconsistency {
                    token_key: row.key.clone(),
                    problem: "expired but still stored".into(),
                });
            }
            if let Some(parent_key) = &row.parent {
                match by_key.get(parent_key.as_str()) {
                    None => findings.push(Inconsistency {
                        token_key: row.key.clone(),
                        problem: format!("parent {} missing", parent_key),
                    }),
                    Some(parent) if !row.scopes.is_subset(&parent.scopes) => {
                        findings.push(Inconsistency {
                            token_key: row.key.clone(),
                            problem: "scopes exceed parent scopes".into(),
                        })
                    }
                    Some(_) => {}
                }
            }
            if let Ok(Some(blob)) = self.cache.get(&token_cache_key(&row.key)).await {
                match self.decode_cached(&blob) {
                    Some(cached) if cached.token.hash_secret() == row.hash => {}
                    _ => findings.push(Inconsistency {
                        token_key: row.key.clone(),
                        problem: "cache record does not match database".into(),
                    }),
                }
            }
        }
        Ok(findings)
    }

    /// Seal and store a token record in the cache with a TTL bounded by the
    /// remaining lifetime.
    async fn cache_store(&self, data: &TokenData) -> anyhow::Result<()> {
        let Some(ttl) = cache_ttl(data.expires, Utc::now()) else {
            return Ok(());
        };
        let payload = serde_json::to_vec(data)?;
        let sealed = self.sealer.seal(&payload);
        self.cache
            .set(&token_cache_key(data.token.key()), sealed.as_bytes(), ttl)
            .await
    }

    fn decode_cached(&self, blob: &[u8]) -> Option<TokenData> {
        let sealed = std::str::from_utf8(blob).ok()?;
        let payload = self.sealer.unseal(sealed, AUTH_CACHE_TTL).ok()?;
        serde_json::from_slice(&payload).ok()
    }
}

pub(crate) fn token_cache_key(key: &str) -> String {
    format!("token:{}", key)
}

pub(crate) fn notebook_cache_key(parent_key: &str) -> String {
    format!("notebook:{}", parent_key)
}

pub(crate) fn internal_cache_key(fingerprint: &str) -> String {
    format!("internal:{}", fingerprint)
}

fn constant_time_wire_eq(a: &Token, b: &Token) -> bool {
    a.encode().as_bytes().ct_eq(b.encode().as_bytes()).into()
}

fn data_from_row(row: TokenRow, token: Token) -> TokenData {
    TokenData {
        token,
        username: row.username,
        kind: row.kind,
        scopes: row.scopes,
        created: row.created,
        expires: row.expires,
        token_name: row.token_name,
        parent: row.parent,
        // The email travels only in the sealed cache record.
        email: None,
    }
}

fn info_from_row(row: TokenRow) -> TokenInfo {
    TokenInfo {
        token: row.key,
        username: row.username,
        token_type: row.kind,
        scopes: row.scopes.into_iter().collect(),
        created: row.created,
        expires: row.expires,
        token_name: row.token_name,
        parent: row.parent,
    }
}

/// TTL for a cached record: the remaining lifetime capped at five minutes,
/// or `None` when the token is already expired and should not be cached.
fn cache_ttl(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    match expires {
        None => Some(AUTH_CACHE_TTL),
        Some(expires) => {
            let remaining = (expires - now).num_seconds();
            if remaining <= 0 {
                None
            } else {
                Some(AUTH_CACHE_TTL.min(Duration::from_secs(remaining as u64)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_ttl_is_bounded_by_lifetime() {
        let now = Utc::now();
        assert_eq!(cache_ttl(None, now), Some(AUTH_CACHE_TTL));
        let soon = now + chrono::Duration::seconds(60);
        assert_eq!(cache_ttl(Some(soon), now), Some(Duration::from_secs(60)));
        let far = now + chrono::Duration::hours(10);
        assert_eq!(cache_ttl(Some(far), now), Some(AUTH_CACHE_TTL));
        let past = now - chrono::Duration::seconds(1);
        assert_eq!(cache_ttl(Some(past), now), None);
    }
}
