//! Cache-aside layer used by the read repositories.
//!
//! The cache only ever holds serialized copies of rows that live in SQLite.
//! Failures talking to it are logged and swallowed so that a read which can
//! be served from the database never fails because of the cache.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default entry lifetime: two minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Key under which the full job listing is cached.
pub const ALL_JOBS_KEY: &str = "jobs:all";
/// Key under which the full user listing is cached.
pub const ALL_USERS_KEY: &str = "users:all";

pub fn job_key(job_id: Uuid) -> String {
    format!("job:{job_id}")
}

pub fn shared_jobs_key(client_id: Uuid) -> String {
    format!("jobs:shared:{client_id}")
}

/// Errors surfaced by a cache backend.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid cache ttl: {0:?}")]
    InvalidTtl(Duration),
}

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCache;

#[async_trait]
impl CacheStore for NoopCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Ok(())
    }
}

struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process TTL cache.
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock: Arc::new(Utc::now),
        }
    }

    /// Overrides the clock used to stamp and check expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Drops every expired entry, returning how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = self.now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let ttl_delta = chrono::Duration::from_std(ttl).map_err(|_| CacheError::InvalidTtl(ttl))?;
        let expires_at = self.now() + ttl_delta;
        self.entries
            .write()
            .await
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Cache-aside helper shared by the repositories.
#[derive(Clone)]
pub struct ReadThrough {
    cache: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ReadThrough {
    pub fn new(cache: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Serves `key` from the cache, or runs `load` and populates the cache with its result.
    ///
    /// Only errors from `load` are returned. A corrupt cached payload counts as a miss.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    counter!("cache_requests_total", "result" => "hit").increment(1);
                    debug!(stage = "cache", key, "cache hit");
                    return Ok(value);
                }
                Err(err) => {
                    counter!("cache_requests_total", "result" => "error").increment(1);
                    warn!(stage = "cache", key, error = %err, "discarding undecodable cache entry");
                }
            },
            Ok(None) => {
                counter!("cache_requests_total", "result" => "miss").increment(1);
                debug!(stage = "cache", key, "cache miss");
            }
            Err(err) => {
                counter!("cache_requests_total", "result" => "error").increment(1);
                warn!(stage = "cache", key, error = %err, "cache read failed, falling back to storage");
            }
        }

        let value = load().await?;
        self.populate(key, &value).await;
        Ok(value)
    }

    async fn populate<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(stage = "cache", key, error = %err, "failed to serialize value for cache");
                return;
            }
        };
        if let Err(err) = self.cache.set(key, raw, self.ttl).await {
            warn!(stage = "cache", key, error = %err, "failed to populate cache");
        }
    }

    /// Deletes `keys`; failures are logged and leave the entries to expire by TTL.
    pub async fn invalidate<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            match self.cache.delete(key).await {
                Ok(()) => {
                    counter!("cache_invalidations_total", "result" => "ok").increment(1);
                }
                Err(err) => {
                    counter!("cache_invalidations_total", "result" => "error").increment(1);
                    warn!(stage = "cache", key, error = %err, "cache invalidation failed");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    /// Backend that fails every call, standing in for an unreachable cache server.
    pub(crate) struct FailingCache;

    #[async_trait]
    impl CacheStore for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    fn manual_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, MemoryCache) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let cache = MemoryCache::new()
            .with_clock(Arc::new(move || *handle.lock().expect("clock poisoned")));
        (now, cache)
    }

    #[tokio::test]
    async fn memory_cache_expires_entries() {
        let start = Utc::now();
        let (now, cache) = manual_clock(start);
        cache
            .set("k", "v".to_string(), Duration::from_secs(120))
            .await
            .expect("set");
        assert_eq!(cache.get("k").await.expect("get"), Some("v".to_string()));

        *now.lock().unwrap() = start + chrono::Duration::seconds(119);
        assert!(cache.get("k").await.expect("get").is_some());

        *now.lock().unwrap() = start + chrono::Duration::seconds(120);
        assert_eq!(cache.get("k").await.expect("get"), None);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.purge_expired().await, 1);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn memory_cache_delete_removes_entry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v".to_string(), DEFAULT_TTL)
            .await
            .expect("set");
        cache.delete("k").await.expect("delete");
        assert_eq!(cache.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn read_through_loads_once_then_hits() {
        let cache = ReadThrough::new(Arc::new(MemoryCache::new()), DEFAULT_TTL);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let value: Vec<u32> = cache
                .get_or_load("numbers", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(vec![1, 2, 3])
                })
                .await
                .expect("load");
            assert_eq!(value, vec![1, 2, 3]);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_through_survives_failing_backend() {
        let cache = ReadThrough::new(Arc::new(FailingCache), DEFAULT_TTL);
        let value: String = cache
            .get_or_load("key", || async { Ok::<_, std::io::Error>("fresh".to_string()) })
            .await
            .expect("cache failure must not fail the read");
        assert_eq!(value, "fresh");
        cache.invalidate([ALL_JOBS_KEY]).await;
    }

    #[tokio::test]
    async fn read_through_treats_corrupt_payload_as_miss() {
        let backend = Arc::new(MemoryCache::new());
        backend
            .set("key", "{not json".to_string(), DEFAULT_TTL)
            .await
            .expect("set");
        let cache = ReadThrough::new(backend.clone(), DEFAULT_TTL);
        let value: Vec<String> = cache
            .get_or_load("key", || async { Ok::<_, std::io::Error>(vec!["a".to_string()]) })
            .await
            .expect("load");
        assert_eq!(value, vec!["a".to_string()]);
        assert_eq!(
            backend.get("key").await.expect("get"),
            Some("[\"a\"]".to_string())
        );
    }

    #[tokio::test]
    async fn read_through_propagates_loader_errors_without_caching() {
        let backend = Arc::new(MemoryCache::new());
        let cache = ReadThrough::new(backend.clone(), DEFAULT_TTL);
        let result: Result<String, std::io::Error> = cache
            .get_or_load("key", || async {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "db down"))
            })
            .await;
        assert!(result.is_err());
        assert!(backend.is_empty().await);
    }

    #[test]
    fn keys_are_scoped_by_id() {
        let id = Uuid::nil();
        assert_eq!(job_key(id), format!("job:{id}"));
        assert_ne!(shared_jobs_key(Uuid::new_v4()), shared_jobs_key(Uuid::new_v4()));
    }
}
