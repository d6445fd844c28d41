//! Key-value store adapter.
//!
//! Shared proxy state (accounts, rate limits, quotas, signatures, token
//! caches, usage stats) lives under fixed key prefixes in redis when
//! `REDIS_ADDR` is configured. Without redis, or when redis becomes
//! unreachable, every operation transparently degrades to an in-process map
//! with identical TTL semantics, so the dispatcher keeps functioning.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;

/// Key prefixes for each persisted entity kind.
pub mod prefix {
    /// Account records, keyed by email.
    pub const ACCT: &str = "acct:";
    /// Rate-limit entries, keyed by `email:model`.
    pub const RL: &str = "rl:";
    /// Quota snapshots, keyed by email.
    pub const QUOTA: &str = "quota:";
    /// Health scores, keyed by email.
    pub const HEALTH: &str = "health:";
    /// Token buckets, keyed by email.
    pub const TOK: &str = "tok:";
    /// Cached access tokens, keyed by email.
    pub const TOKCACHE: &str = "tokcache:";
    /// Cached project ids, keyed by email.
    pub const PROJCACHE: &str = "projcache:";
    /// Tool-use signatures, keyed by tool_use_id.
    pub const SIG: &str = "sig:";
    /// Thinking signature -> model family, keyed by signature.
    pub const THINKSIG: &str = "thinksig:";
    /// Usage counters, keyed by `email:model:date`.
    pub const STATS: &str = "stats:";
}

/// Errors surfaced by the store adapter.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

struct MemEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Typed key-value access with TTL, backed by redis with an in-process
/// fallback map.
pub struct Store {
    redis: Option<ConnectionManager>,
    memory: RwLock<HashMap<String, MemEntry>>,
}

impl Store {
    /// Connect to redis if an address is configured. Connection failures are
    /// logged and leave the store in memory-only mode.
    pub async fn connect(addr: Option<&str>, password: Option<&str>) -> Self {
        let redis = match addr {
            Some(addr) => match Self::open_redis(addr, password).await {
                Ok(conn) => {
                    tracing::info!(addr, "Connected to redis");
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(addr, error = %e, "Redis unavailable, using in-process store");
                    None
                }
            },
            None => None,
        };

        Self {
            redis,
            memory: RwLock::new(HashMap::new()),
        }
    }

    /// Memory-only store (tests, redis-less deployments).
    pub fn in_memory() -> Self {
        Self {
            redis: None,
            memory: RwLock::new(HashMap::new()),
        }
    }

    /// Whether a redis backend is attached.
    pub fn is_persistent(&self) -> bool {
        self.redis.is_some()
    }

    async fn open_redis(addr: &str, password: Option<&str>) -> Result<ConnectionManager, StoreError> {
        let url = build_redis_url(addr, password);
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Fetch and deserialize a value. Missing, expired, or unparseable
    /// entries yield `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unparseable store entry");
                None
            }
        }
    }

    /// Serialize and store a value with an optional TTL.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.put_raw(key, raw, ttl).await,
            Err(e) => tracing::error!(key, error = %e, "Failed to serialize store entry"),
        }
    }

    /// Fetch a raw string value.
    pub async fn get_raw(&self, key: &str) -> Option<String> {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match conn.get::<_, Option<String>>(key).await {
                Ok(value) => return value,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Redis read failed, falling back to memory");
                }
            }
        }

        let mut memory = self.memory.write().await;
        match memory.get(key) {
            Some(entry) if entry.is_expired() => {
                memory.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Store a raw string value with an optional TTL.
    pub async fn put_raw(&self, key: &str, value: String, ttl: Option<Duration>) {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            let result: Result<(), _> = match ttl {
                Some(ttl) => {
                    conn.set_ex(key, &value, ttl.as_secs().max(1)).await
                }
                None => conn.set(key, &value).await,
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(key, error = %e, "Redis write failed, falling back to memory");
                }
            }
        }

        let mut memory = self.memory.write().await;
        memory.insert(
            key.to_string(),
            MemEntry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    /// Remove a key.
    pub async fn delete(&self, key: &str) {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            if let Err(e) = conn.del::<_, ()>(key).await {
                tracing::warn!(key, error = %e, "Redis delete failed");
            }
        }
        self.memory.write().await.remove(key);
    }

    /// List keys under a prefix. Used to enumerate accounts and to clear
    /// whole prefixes; the key population is small (one entry per account).
    pub async fn keys(&self, key_prefix: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();

        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match conn.keys::<_, Vec<String>>(format!("{key_prefix}*")).await {
                Ok(keys) => found = keys,
                Err(e) => {
                    tracing::warn!(prefix = key_prefix, error = %e, "Redis KEYS failed");
                }
            }
        }

        let memory = self.memory.read().await;
        for (key, entry) in memory.iter() {
            if key.starts_with(key_prefix) && !entry.is_expired() && !found.contains(key) {
                found.push(key.clone());
            }
        }
        found
    }

    /// Remove every key under a prefix.
    pub async fn delete_prefix(&self, key_prefix: &str) {
        for key in self.keys(key_prefix).await {
            self.delete(&key).await;
        }
    }

    /// Increment a counter, creating it with the given TTL.
    pub async fn incr(&self, key: &str, ttl: Duration) -> i64 {
        if let Some(conn) = &self.redis {
            let mut conn = conn.clone();
            match conn.incr::<_, _, i64>(key, 1).await {
                Ok(n) => {
                    if n == 1 {
                        let _: Result<(), _> = conn.expire(key, ttl.as_secs() as i64).await;
                    }
                    return n;
                }
                Err(e) => {
                    tracing::warn!(key, error = %e, "Redis INCR failed, falling back to memory");
                }
            }
        }

        let mut memory = self.memory.write().await;
        let next = match memory.get(key) {
            Some(entry) if !entry.is_expired() => {
                entry.value.parse::<i64>().unwrap_or(0) + 1
            }
            _ => 1,
        };
        let expires_at = match memory.get(key) {
            Some(entry) if !entry.is_expired() => entry.expires_at,
            _ => Some(Instant::now() + ttl),
        };
        memory.insert(
            key.to_string(),
            MemEntry {
                value: next.to_string(),
                expires_at,
            },
        );
        next
    }
}

fn build_redis_url(addr: &str, password: Option<&str>) -> String {
    let base = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    };
    match password {
        Some(pass) if !base.contains('@') => {
            // redis://host:port -> redis://:pass@host:port
            base.replacen("://", &format!("://:{pass}@"), 1)
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_put_get_json() {
        let store = Store::in_memory();
        let sample = Sample {
            name: "a".into(),
            count: 3,
        };
        store.put_json("acct:a@example.com", &sample, None).await;

        let loaded: Option<Sample> = store.get_json("acct:a@example.com").await;
        assert_eq!(loaded, Some(sample));
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = Store::in_memory();
        let loaded: Option<Sample> = store.get_json("acct:missing").await;
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = Store::in_memory();
        store
            .put_raw("rl:a:m", "x".into(), Some(Duration::from_millis(20)))
            .await;
        assert!(store.get_raw("rl:a:m").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get_raw("rl:a:m").await.is_none());
    }

    #[tokio::test]
    async fn test_keys_prefix() {
        let store = Store::in_memory();
        store.put_raw("acct:a", "1".into(), None).await;
        store.put_raw("acct:b", "2".into(), None).await;
        store.put_raw("rl:a:m", "3".into(), None).await;

        let mut keys = store.keys(prefix::ACCT).await;
        keys.sort();
        assert_eq!(keys, vec!["acct:a".to_string(), "acct:b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = Store::in_memory();
        store.put_raw("tokcache:a", "t".into(), None).await;
        store.put_raw("tokcache:b", "t".into(), None).await;
        store.delete_prefix(prefix::TOKCACHE).await;
        assert!(store.keys(prefix::TOKCACHE).await.is_empty());
    }

    #[tokio::test]
    async fn test_incr() {
        let store = Store::in_memory();
        assert_eq!(store.incr("stats:a:m:2026-01-01", Duration::from_secs(60)).await, 1);
        assert_eq!(store.incr("stats:a:m:2026-01-01", Duration::from_secs(60)).await, 2);
    }

    #[test]
    fn test_build_redis_url() {
        assert_eq!(build_redis_url("127.0.0.1:6379", None), "redis://127.0.0.1:6379");
        assert_eq!(
            build_redis_url("redis://host:6379", Some("secret")),
            "redis://:secret@host:6379"
        );
        assert_eq!(
            build_redis_url("redis://user:pw@host:6379", Some("ignored")),
            "redis://user:pw@host:6379"
        );
    }
}
