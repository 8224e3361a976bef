//! Cache store abstraction over Redis
//!
//! The cache is always a projection, never the source of truth. Everything
//! here is TTL-friendly: dedup markers, lock leases, and cooldown stamps all
//! expire on their own, so correctness never depends on explicit deletion.
//!
//! A trait seam keeps the billing services testable: production binds
//! [`RedisStore`], development and tests bind [`MemoryStore`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;

/// Cache store errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache value for {key} is not valid JSON: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Key-value store with TTLs, the only coordination primitive shared between
/// otherwise stateless request invocations.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Set a value, with an optional TTL.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Set a value only if the key is absent. Returns true when this call won
    /// the key. The basis of lease acquisition and dedup markers.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Delete the key only if it currently holds `expected`. Returns true if
    /// the key was removed. Used for fenced lease release: a request that
    /// outlived its lease cannot release a lease it no longer owns.
    async fn delete_if_value(&self, key: &str, expected: &str) -> CacheResult<bool>;

    /// Set membership, used as an enumeration index over cache records
    /// (plain key-value stores cannot be scanned cheaply).
    async fn set_add(&self, set: &str, member: &str) -> CacheResult<()>;

    async fn set_remove(&self, set: &str, member: &str) -> CacheResult<()>;

    async fn set_members(&self, set: &str) -> CacheResult<Vec<String>>;
}

// =============================================================================
// Redis implementation
// =============================================================================

/// Redis-backed store using a shared connection manager
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        tracing::info!("Redis connection established");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut conn = self.conn.clone();
        // SET NX EX is atomic; a plain SETNX followed by EXPIRE could leave
        // an immortal lock if the process dies between the two commands.
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(outcome.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> CacheResult<bool> {
        // Compare-and-delete via a small Lua script so the read and the
        // delete cannot interleave with another client's acquire.
        const RELEASE_SCRIPT: &str = r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn set_add(&self, set: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(set, member).await?;
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(set, member).await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(set).await?;
        Ok(members)
    }
}

// =============================================================================
// In-memory implementation (for development without Redis, and for tests)
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, (String, Option<Instant>)>,
    sets: HashMap<String, std::collections::HashSet<String>>,
}

impl MemoryInner {
    fn live_value(&mut self, key: &str) -> Option<String> {
        let expired = match self.values.get(key) {
            Some((_, Some(deadline))) => *deadline <= Instant::now(),
            Some((_, None)) => false,
            None => return None,
        };
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|(value, _)| value.clone())
    }
}

/// In-memory store with TTL emulation
#[derive(Default)]
pub struct MemoryStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.live_value(key))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        let deadline = ttl.map(|t| Instant::now() + t);
        inner.values.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        Ok(())
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> CacheResult<bool> {
        let mut inner = self.inner.lock().await;
        if inner.live_value(key).as_deref() == Some(expected) {
            inner.values.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn set_add(&self, set: &str, member: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, set: &str) -> CacheResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(set)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// JSON helpers over any [`KvStore`]
pub async fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> CacheResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => {
            let parsed = serde_json::from_str(&raw).map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

pub async fn put_json<T: serde::Serialize>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> CacheResult<()> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    store.put(key, &raw, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_if_absent_is_first_writer_wins() {
        let store = MemoryStore::new();
        assert!(store
            .put_if_absent("k", "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .put_if_absent("k", "b", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let store = MemoryStore::new();
        store
            .put("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // Key is reclaimable once expired
        assert!(store
            .put_if_absent("k", "w", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_if_value_only_releases_own_token() {
        let store = MemoryStore::new();
        store
            .put_if_absent("lock", "token-a", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.delete_if_value("lock", "token-b").await.unwrap());
        assert!(store.delete_if_value("lock", "token-a").await.unwrap());
        assert_eq!(store.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_membership_round_trips() {
        let store = MemoryStore::new();
        store.set_add("pending", "a").await.unwrap();
        store.set_add("pending", "b").await.unwrap();
        store.set_remove("pending", "a").await.unwrap();
        assert_eq!(store.set_members("pending").await.unwrap(), vec!["b"]);
    }
}
