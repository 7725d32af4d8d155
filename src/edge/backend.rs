//! Cache entry model and storage backends.
//!
//! A [`CachedEntry`] is an explicit `{status, headers, body, expiry}` record
//! rather than a stored response object; strategies stamp response markers
//! when they turn an entry back into an [`HttpResponse`].
//!
//! Backends only store and enumerate entries in insertion order. Expiry and
//! eviction policy live above them, in the strategy layer, so every backend
//! honours the same bucket limits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::net::HttpResponse;
use crate::{HuginnError, Result};

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Write time, ms since the Unix epoch.
    pub stored_at: u64,
    /// First instant (ms) at which the entry is no longer fresh.
    pub expires_at: u64,
}

impl CachedEntry {
    /// Capture `response` at time `now`, fresh for `max_age`.
    pub fn from_response(response: &HttpResponse, max_age: Duration, now: u64) -> Self {
        Self {
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            stored_at: now,
            expires_at: now.saturating_add(max_age.as_millis() as u64),
        }
    }

    /// Fresh entries may be served without consulting the network.
    pub fn is_fresh(&self, now: u64) -> bool {
        now <= self.expires_at
    }

    pub fn to_response(&self) -> HttpResponse {
        HttpResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Storage for cache buckets.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>>;

    /// Insert or overwrite. Overwriting moves the key to the newest position.
    async fn put(&self, bucket: &str, key: &str, entry: CachedEntry) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Keys of `bucket`, oldest first.
    async fn keys(&self, bucket: &str) -> Result<Vec<String>>;

    async fn len(&self, bucket: &str) -> Result<usize>;

    async fn clear(&self, bucket: &str) -> Result<()>;
}

#[derive(Default)]
struct BucketEntries {
    order: VecDeque<String>,
    entries: HashMap<String, CachedEntry>,
}

/// In-process [`CacheBackend`].
#[derive(Default)]
pub struct MemoryCacheBackend {
    buckets: Mutex<HashMap<String, BucketEntries>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_buckets<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, BucketEntries>) -> T,
    ) -> Result<T> {
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|e| HuginnError::Storage(format!("cache lock poisoned: {e}")))?;
        Ok(f(&mut buckets))
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<CachedEntry>> {
        self.with_buckets(|b| b.get(bucket).and_then(|e| e.entries.get(key)).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, entry: CachedEntry) -> Result<()> {
        self.with_buckets(|b| {
            let bucket = b.entry(bucket.to_string()).or_default();
            if bucket.entries.insert(key.to_string(), entry).is_some() {
                bucket.order.retain(|k| k != key);
            }
            bucket.order.push_back(key.to_string());
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
        self.with_buckets(|b| match b.get_mut(bucket) {
            Some(bucket) => {
                let removed = bucket.entries.remove(key).is_some();
                if removed {
                    bucket.order.retain(|k| k != key);
                }
                removed
            }
            None => false,
        })
    }

    async fn keys(&self, bucket: &str) -> Result<Vec<String>> {
        self.with_buckets(|b| {
            b.get(bucket)
                .map(|e| e.order.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn len(&self, bucket: &str) -> Result<usize> {
        self.with_buckets(|b| b.get(bucket).map_or(0, |e| e.entries.len()))
    }

    async fn clear(&self, bucket: &str) -> Result<()> {
        self.with_buckets(|b| {
            b.remove(bucket);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &str) -> CachedEntry {
        CachedEntry::from_response(&HttpResponse::new(200, body), Duration::from_secs(60), 1_000)
    }

    #[test]
    fn freshness_boundary() {
        let e = entry("x");
        assert_eq!(e.expires_at, 61_000);
        assert!(e.is_fresh(61_000));
        assert!(!e.is_fresh(61_001));
    }

    #[tokio::test]
    async fn overwrite_moves_key_to_newest() {
        let backend = MemoryCacheBackend::new();
        backend.put("b", "a", entry("1")).await.unwrap();
        backend.put("b", "b", entry("2")).await.unwrap();
        backend.put("b", "a", entry("3")).await.unwrap();
        assert_eq!(backend.keys("b").await.unwrap(), vec!["b", "a"]);
        assert_eq!(backend.len("b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_drops_key_from_order() {
        let backend = MemoryCacheBackend::new();
        backend.put("b", "a", entry("1")).await.unwrap();
        backend.put("b", "b", entry("2")).await.unwrap();

        assert!(backend.delete("b", "a").await.unwrap());
        assert!(!backend.delete("b", "a").await.unwrap());
        assert!(!backend.delete("missing", "a").await.unwrap());
        assert_eq!(backend.keys("b").await.unwrap(), vec!["b"]);
        assert!(backend.get("b", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let backend = MemoryCacheBackend::new();
        backend.put("one", "k", entry("1")).await.unwrap();
        assert!(backend.get("two", "k").await.unwrap().is_none());
        backend.clear("one").await.unwrap();
        assert_eq!(backend.len("one").await.unwrap(), 0);
    }
}
