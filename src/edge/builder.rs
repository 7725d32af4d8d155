//! Builder for configuring edge cache instances

use std::sync::Arc;

use super::{
    CacheBackend, EdgeCache, EdgeConfig, EdgeInner, MemoryCacheBackend, PerformanceTracker, Router,
    SyncQueueManager,
};
use crate::net::{HttpClient, RetryConfig, RetryingHttpClient};
use crate::{HuginnError, Result};

/// Builder for [`EdgeCache`].
pub struct EdgeCacheBuilder {
    config: EdgeConfig,
    backend: Option<Arc<dyn CacheBackend>>,
    client: Option<Arc<dyn HttpClient>>,
    retry: Option<RetryConfig>,
    queue: Option<SyncQueueManager>,
}

impl EdgeCacheBuilder {
    pub fn new() -> Self {
        Self {
            config: EdgeConfig::default(),
            backend: None,
            client: None,
            retry: None,
            queue: None,
        }
    }

    /// Replace the default bucket and routing configuration.
    pub fn config(mut self, config: EdgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache storage (default: [`MemoryCacheBackend`]).
    pub fn backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// HTTP client used for every network leg. Required.
    pub fn client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Wrap the client in a [`RetryingHttpClient`].
    ///
    /// Retries happen inside the network-first timeout, so keep the total
    /// backoff well below the bucket's `network_timeout`.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Queue failed mutations matching a replay route.
    pub fn queue(mut self, queue: SyncQueueManager) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Build the edge cache.
    ///
    /// # Errors
    ///
    /// Returns an error if no client is configured, the configuration
    /// references unknown buckets, or a route pattern does not compile.
    pub fn build(self) -> Result<EdgeCache> {
        let client = self.client.ok_or_else(|| {
            HuginnError::Configuration("edge cache requires an HTTP client".to_string())
        })?;
        let client = match self.retry {
            Some(retry) => Arc::new(RetryingHttpClient::new(client, retry)) as Arc<dyn HttpClient>,
            None => client,
        };

        self.config.validate()?;
        let router = Router::new(&self.config)?;
        let perf = PerformanceTracker::new(self.config.metrics_capacity);

        Ok(EdgeCache {
            inner: Arc::new(EdgeInner {
                router,
                backend: self
                    .backend
                    .unwrap_or_else(|| Arc::new(MemoryCacheBackend::new())),
                client,
                perf,
                queue: self.queue,
                config: self.config,
            }),
        })
    }
}

impl Default for EdgeCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}
