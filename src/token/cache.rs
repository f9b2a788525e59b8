//! Key-value cache backing the authentication fast path.
//!
//! The cache holds three families of keys: `token:<key>` mapping to a sealed
//! token record, and `internal:<fingerprint>` / `notebook:<parent key>`
//! mapping to the wire form of a live minted child token. Entries always
//! carry a TTL no longer than the remaining lifetime of the token they
//! describe.
//!
//! Two implementations exist: Redis for real deployments (and the only
//! choice when more than one replica runs, since single-flight minting
//! relies on a shared lock), and an in-process map for single-replica
//! deployments and tests. Both are consumed through the narrow
//! [`TokenCache`] trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Narrow interface over the key-value cache.
///
/// `lock`/`unlock` implement the short-lived mint lock: `lock` atomically
/// creates the key only when absent and returns whether this caller won.
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn lock(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn unlock(&self, key: &str) -> Result<()>;
}

/// Redis-backed cache.
pub struct RedisTokenCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisTokenCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parsing redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connecting to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.context("redis GET")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await.context("redis SETEX")?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.context("redis DEL")?;
        Ok(())
    }

    async fn lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX EX is the atomic compare-and-set: only one concurrent
        // caller observes OK.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis SET NX")?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}

/// In-process cache for single-replica deployments and tests.
pub struct MemoryTokenCache {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryTokenCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, deadline)) if *deadline > Instant::now() => Ok(false),
            _ => {
                entries.insert(key.to_string(), (Vec::new(), Instant::now() + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let cache = MemoryTokenCache::new();
        cache
            .set("token:abc", b"value", Duration::from_millis(20))
            .await
            .expect("set");
        assert_eq!(
            cache.get("token:abc").await.expect("get"),
            Some(b"value".to_vec())
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("token:abc").await.expect("get"), None);
    }

    #[tokio::test]
    async fn memory_lock_is_exclusive_until_released() {
        let cache = MemoryTokenCache::new();
        assert!(cache.lock("mint:fp", Duration::from_secs(5)).await.unwrap());
        assert!(!cache.lock("mint:fp", Duration::from_secs(5)).await.unwrap());
        cache.unlock("mint:fp").await.unwrap();
        assert!(cache.lock("mint:fp", Duration::from_secs(5)).await.unwrap());
    }
}
