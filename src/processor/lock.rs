//! Distributed mutual exclusion for the task processor.
//!
//! The lock is a single Redis key set with `SET NX PX`. Its value is an owner
//! token of the form `{pid}-{unix_ms}-{hex}`; only the holder of that exact
//! token may delete the key, which is done atomically in a Lua script.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors raised by a lock store.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to connect to lock store: {0}")]
    ConnectionFailed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Deletes KEYS[1] only when it still holds ARGV[1].
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Owner token stored as the lock value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Builds a fresh token for a process id.
    pub fn generate(pid: u32) -> Self {
        let random: [u8; 8] = rand::rng().random();
        let now_ms = chrono::Utc::now().timestamp_millis();
        Self(format!("{}-{}-{}", pid, now_ms, hex::encode(random)))
    }

    /// Wraps a raw value read back from the store.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Process id encoded in the token, if the token is well formed.
    pub fn pid(&self) -> Option<u32> {
        token_pid(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extracts the leading pid from a raw token.
pub fn token_pid(raw: &str) -> Option<u32> {
    raw.split('-').next()?.parse().ok()
}

/// Snapshot of the lock as seen by one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub is_locked: bool,
    pub holder: Option<String>,
    pub owned_by_this_instance: bool,
}

/// Storage for the task processor lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Sets `key` to `token` with `ttl` if absent. Returns whether we got it.
    async fn try_acquire(&self, key: &str, token: &LockToken, ttl: Duration)
        -> Result<bool, LockError>;

    /// Current value of `key`.
    async fn holder(&self, key: &str) -> Result<Option<String>, LockError>;

    /// Deletes `key` only if it holds `token`.
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError>;

    /// Deletes `key` unconditionally.
    async fn force_clear(&self, key: &str) -> Result<bool, LockError>;
}

/// Redis-backed lock store.
#[derive(Clone)]
pub struct RedisLockStore {
    redis: ConnectionManager,
    release: redis::Script,
}

impl RedisLockStore {
    pub async fn connect(redis_url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| LockError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis))
    }

    /// Shares an existing connection, e.g. the queue backend's.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self {
            redis,
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.redis.clone();
        Ok(conn.get(key).await?)
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!(key = %key, token = %token, "Lock not released, token no longer holds it");
        }
        Ok(deleted > 0)
    }

    async fn force_clear(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.redis.clone();
        let deleted: i64 = conn.del(key).await?;
        Ok(deleted > 0)
    }
}

/// In-process lock store with TTL expiry, for tests and single-node runs.
#[derive(Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some((_, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), (token.as_str().to_string(), now + ttl));
        Ok(true)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, LockError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, _)) if value == token.as_str() => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_clear(&self, key: &str) -> Result<bool, LockError> {
        Ok(self.entries.lock().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test:task-operator:lock";

    #[test]
    fn test_token_format() {
        let token = LockToken::generate(4242);
        let parts: Vec<&str> = token.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "4242");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 16);
        assert_eq!(token.pid(), Some(4242));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(LockToken::generate(1), LockToken::generate(1));
    }

    #[test]
    fn test_token_pid_rejects_garbage() {
        assert_eq!(token_pid("not-a-token"), None);
        assert_eq!(token_pid(""), None);
        assert_eq!(token_pid("77-1700000000000-ab"), Some(77));
    }

    #[tokio::test]
    async fn test_memory_lock_is_exclusive() {
        let store = MemoryLockStore::new();
        let first = LockToken::generate(1);
        let second = LockToken::generate(2);
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire(KEY, &first, ttl).await.unwrap());
        assert!(!store.try_acquire(KEY, &second, ttl).await.unwrap());
        assert_eq!(
            store.holder(KEY).await.unwrap().as_deref(),
            Some(first.as_str())
        );
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let store = MemoryLockStore::new();
        let owner = LockToken::generate(1);
        let intruder = LockToken::generate(2);
        let ttl = Duration::from_secs(60);

        store.try_acquire(KEY, &owner, ttl).await.unwrap();
        assert!(!store.release(KEY, &intruder).await.unwrap());
        assert!(store.holder(KEY).await.unwrap().is_some());

        assert!(store.release(KEY, &owner).await.unwrap());
        assert!(store.holder(KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let store = MemoryLockStore::new();
        let stale = LockToken::generate(1);
        let fresh = LockToken::generate(2);

        store
            .try_acquire(KEY, &stale, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.holder(KEY).await.unwrap().is_none());
        assert!(store
            .try_acquire(KEY, &fresh, Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_force_clear() {
        let store = MemoryLockStore::new();
        store
            .try_acquire(KEY, &LockToken::generate(9), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.force_clear(KEY).await.unwrap());
        assert!(!store.force_clear(KEY).await.unwrap());
    }

    #[test]
    fn test_release_script_checks_value() {
        assert!(RELEASE_SCRIPT.contains("GET"));
        assert!(RELEASE_SCRIPT.contains("DEL"));
    }
}
