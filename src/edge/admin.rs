//! Cache maintenance: statistics, warming, clearing and the expiry sweep.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BucketConfig, EdgeCache};
use crate::net::HttpRequest;
use crate::time::now_millis;
use crate::{HuginnError, Result};

/// Per-bucket statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    pub hit_rate: f64,
    pub config: BucketConfig,
}

/// Snapshot of the whole cache.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeStats {
    pub buckets: BTreeMap<String, BucketStats>,
    pub total_entries: usize,
    pub cache_version: String,
}

/// Outcome of warming one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmResult {
    pub url: String,
    pub bucket: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EdgeCache {
    /// Entry counts and hit/miss counters for every configured bucket.
    pub async fn stats(&self) -> Result<EdgeStats> {
        let mut buckets = BTreeMap::new();
        let mut total_entries = 0;
        for (name, config) in &self.inner.config.buckets {
            let entries = self.inner.backend.len(name).await?;
            let counters = self.inner.perf.counters(name);
            total_entries += entries;
            buckets.insert(
                name.clone(),
                BucketStats {
                    entries,
                    hits: counters.hits,
                    misses: counters.misses,
                    fallbacks: counters.fallbacks,
                    hit_rate: counters.hit_rate(),
                    config: config.clone(),
                },
            );
        }
        Ok(EdgeStats {
            buckets,
            total_entries,
            cache_version: crate::version::version_info().cache_version,
        })
    }

    /// Fetch `urls` concurrently and store each response in its bucket,
    /// regardless of strategy. Failures are reported per URL.
    pub async fn warm(&self, urls: &[String]) -> Vec<WarmResult> {
        let tasks = urls.iter().map(|url| async move {
            let bucket = self.inner.router.classify(url);
            let result = async {
                let cache = self.bucket(&bucket)?;
                let request = HttpRequest::get(url.clone());
                let response = self.inner.client.send(request.clone()).await?;
                cache.store(&request.cache_key(), &response).await;
                Ok::<_, HuginnError>(())
            }
            .await;
            if let Err(e) = &result {
                warn!(url = %url, error = %e, "cache warm failed");
            }
            WarmResult {
                url: url.clone(),
                bucket,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }
        });
        let results = join_all(tasks).await;
        info!(
            requested = results.len(),
            warmed = results.iter().filter(|r| r.success).count(),
            "cache warm finished"
        );
        results
    }

    /// Empty one bucket.
    pub async fn clear_bucket(&self, name: &str) -> Result<()> {
        if !self.inner.config.buckets.contains_key(name) {
            return Err(HuginnError::UnknownBucket(name.to_string()));
        }
        self.inner.backend.clear(name).await?;
        info!(bucket = name, "cleared cache bucket");
        Ok(())
    }

    /// Empty every bucket.
    pub async fn clear_all(&self) -> Result<()> {
        for name in self.inner.config.buckets.keys() {
            self.inner.backend.clear(name).await?;
        }
        info!("cleared all cache buckets");
        Ok(())
    }

    /// Purge expired entries from every bucket. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = now_millis();
        let mut removed = 0;
        for name in self.inner.config.buckets.keys() {
            for key in self.inner.backend.keys(name).await? {
                let expired = self
                    .inner
                    .backend
                    .get(name, &key)
                    .await?
                    .is_some_and(|entry| !entry.is_fresh(now));
                if expired && self.inner.backend.delete(name, &key).await? {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = cache.sweep_expired().await {
                    warn!(error = %e, "cache sweep failed");
                }
            }
        })
    }
}
