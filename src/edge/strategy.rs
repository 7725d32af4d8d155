//! Caching strategy execution.
//!
//! | Strategy | Fresh entry | Stale / no entry | Network failure |
//! |----------|-------------|------------------|-----------------|
//! | cache-first | served, no network | fetch + store | error |
//! | network-first | fetch wins | fetch + store | any cached entry, marked fallback |
//! | stale-while-revalidate | served, background refresh | fetch + store | error |
//!
//! Cache bookkeeping failures (lookups, writes, eviction) are logged and
//! swallowed: they never fail the response being served.

use std::sync::Arc;

use tracing::{debug, warn};

use super::backend::{CacheBackend, CachedEntry};
use super::config::{BucketConfig, Strategy};
use crate::net::{HttpClient, HttpRequest, HttpResponse};
use crate::telemetry;
use crate::time::now_millis;
use crate::{HuginnError, Result};

/// Marker header set on responses served from cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";
/// Marker header set on responses served as a fallback.
pub const FALLBACK_HEADER: &str = "x-cache-fallback";
/// Original write time of a cached response (ms since epoch).
pub const CACHED_AT_HEADER: &str = "x-cache-date";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    /// Fresh cache hit.
    Cache,
    Network,
    /// Cached or offline substitute for a failed network leg.
    Fallback,
    /// Mutation accepted into the sync queue for later replay.
    Queued,
}

#[derive(Debug)]
pub(crate) struct Outcome {
    pub response: HttpResponse,
    pub source: ResponseSource,
}

/// One bucket's view of the cache backend. Cheap to clone.
#[derive(Clone)]
pub(crate) struct BucketCache {
    pub name: String,
    pub config: BucketConfig,
    pub backend: Arc<dyn CacheBackend>,
}

impl BucketCache {
    /// Fetch an entry regardless of freshness. Backend errors read as a miss.
    async fn lookup(&self, key: &str) -> Option<CachedEntry> {
        match self.backend.get(&self.name, key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(bucket = %self.name, key, error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Fetch a fresh entry, purging it if it has expired.
    async fn lookup_fresh(&self, key: &str) -> Option<CachedEntry> {
        let entry = self.lookup(key).await?;
        if entry.is_fresh(now_millis()) {
            return Some(entry);
        }
        debug!(bucket = %self.name, key, "purging expired entry");
        if let Err(e) = self.backend.delete(&self.name, key).await {
            warn!(bucket = %self.name, key, error = %e, "failed to purge expired entry");
        }
        None
    }

    /// Store a response, evicting the oldest entries to stay within
    /// `max_entries`. Failures are logged, never returned.
    pub async fn store(&self, key: &str, response: &HttpResponse) {
        if let Err(e) = self.try_store(key, response).await {
            warn!(bucket = %self.name, key, error = %e, "cache write failed");
        }
    }

    async fn try_store(&self, key: &str, response: &HttpResponse) -> Result<()> {
        let limit = self.config.max_entries;
        if limit == 0 {
            return Ok(());
        }
        let keys = self.backend.keys(&self.name).await?;
        if !keys.iter().any(|k| k == key) && keys.len() >= limit {
            let excess = keys.len() + 1 - limit;
            for old in keys.iter().take(excess) {
                self.backend.delete(&self.name, old).await?;
            }
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "bucket" => self.name.clone())
                .increment(excess as u64);
            debug!(bucket = %self.name, evicted = excess, "evicted oldest entries");
        }
        let entry = CachedEntry::from_response(response, self.config.max_age, now_millis());
        self.backend.put(&self.name, key, entry).await
    }
}

/// Run `request` through the strategy configured for `cache`.
pub(crate) async fn execute(
    cache: &BucketCache,
    client: &Arc<dyn HttpClient>,
    request: &HttpRequest,
) -> Result<Outcome> {
    match cache.config.strategy {
        Strategy::CacheFirst => cache_first(cache, client, request).await,
        Strategy::NetworkFirst => network_first(cache, client, request).await,
        Strategy::StaleWhileRevalidate => stale_while_revalidate(cache, client, request).await,
    }
}

async fn cache_first(
    cache: &BucketCache,
    client: &Arc<dyn HttpClient>,
    request: &HttpRequest,
) -> Result<Outcome> {
    let key = request.cache_key();
    if let Some(entry) = cache.lookup_fresh(&key).await {
        return Ok(hit(&entry));
    }
    let response = client.send(request.clone()).await?;
    cache.store(&key, &response).await;
    Ok(network(response))
}

async fn network_first(
    cache: &BucketCache,
    client: &Arc<dyn HttpClient>,
    request: &HttpRequest,
) -> Result<Outcome> {
    let key = request.cache_key();
    let fetch = client.send(request.clone());
    let result = match cache.config.network_timeout {
        Some(limit) => match tokio::time::timeout(limit, fetch).await {
            Ok(result) => result,
            Err(_) => Err(HuginnError::Timeout(limit)),
        },
        None => fetch.await,
    };

    match result {
        Ok(response) => {
            cache.store(&key, &response).await;
            Ok(network(response))
        }
        Err(e) => match cache.lookup(&key).await {
            Some(entry) => {
                debug!(bucket = %cache.name, key, error = %e, "serving cached fallback");
                Ok(fallback(&entry))
            }
            None => Err(e),
        },
    }
}

async fn stale_while_revalidate(
    cache: &BucketCache,
    client: &Arc<dyn HttpClient>,
    request: &HttpRequest,
) -> Result<Outcome> {
    let key = request.cache_key();
    let cached = cache.lookup_fresh(&key).await;

    let refresh = {
        let cache = cache.clone();
        let client = Arc::clone(client);
        let request = request.clone();
        let key = key.clone();
        async move {
            let response = client.send(request).await?;
            cache.store(&key, &response).await;
            Ok::<_, HuginnError>(response)
        }
    };

    match cached {
        Some(entry) => {
            let bucket = cache.name.clone();
            tokio::spawn(async move {
                if let Err(e) = refresh.await {
                    debug!(bucket = %bucket, error = %e, "background revalidation failed");
                }
            });
            Ok(hit(&entry))
        }
        None => refresh.await.map(network),
    }
}

fn hit(entry: &CachedEntry) -> Outcome {
    let response = entry
        .to_response()
        .with_header(CACHE_STATUS_HEADER, "HIT")
        .with_header(CACHED_AT_HEADER, entry.stored_at.to_string());
    Outcome {
        response,
        source: ResponseSource::Cache,
    }
}

fn fallback(entry: &CachedEntry) -> Outcome {
    let response = entry
        .to_response()
        .with_header(CACHE_STATUS_HEADER, "STALE")
        .with_header(FALLBACK_HEADER, "true")
        .with_header(CACHED_AT_HEADER, entry.stored_at.to_string());
    Outcome {
        response,
        source: ResponseSource::Fallback,
    }
}

fn network(response: HttpResponse) -> Outcome {
    Outcome {
        response: response.with_header(CACHE_STATUS_HEADER, "MISS"),
        source: ResponseSource::Network,
    }
}
