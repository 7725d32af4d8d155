//! Edge cache and sync-queue layer.
//!
//! [`EdgeCache`] sits between the application and the network. Each GET
//! request is classified into a named bucket ([`Router`]), served through
//! that bucket's [`Strategy`], and recorded in the [`PerformanceTracker`].
//! Mutating requests go straight to the network; when they fail with a
//! transient error and match a replay route, they are parked in the
//! [`SyncQueueManager`] and answered with `202 Accepted`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huginn::edge::{EdgeCache, EdgeRequest};
//! use huginn::net::ReqwestClient;
//!
//! # async fn example() -> huginn::Result<()> {
//! let cache = EdgeCache::builder()
//!     .client(Arc::new(ReqwestClient::new()?))
//!     .build()?;
//!
//! let response = cache
//!     .handle(EdgeRequest::get("https://console.example.org/api/dashboard/stats"))
//!     .await?;
//! println!("{} via {:?}", response.response.status, response.source);
//! # Ok(())
//! # }
//! ```

mod admin;
mod backend;
mod builder;
mod command;
mod config;
mod handlers;
mod perf;
mod queue;
mod router;
mod strategy;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::net::{HttpClient, HttpRequest, HttpResponse, Method};
use crate::storage::Operation;
use crate::telemetry;
use crate::time::now_millis;
use crate::{HuginnError, Result};

pub use admin::{BucketStats, EdgeStats, WarmResult};
pub use backend::{CacheBackend, CachedEntry, MemoryCacheBackend};
pub use builder::EdgeCacheBuilder;
pub use command::{Command, CommandHandle};
pub use config::{
    BucketConfig, DEFAULT_OFFLINE_PAGE, EdgeConfig, ReplayRoute, RouteRule, Strategy,
};
pub use handlers::{DEFAULT_HANDLER_ENDPOINTS, HttpSyncHandler, default_handlers};
pub use perf::{
    BucketCounters, DEFAULT_SAMPLE_CAPACITY, MetricSummary, PerformanceSample, PerformanceTracker,
};
pub use queue::{DrainReport, EnqueueOptions, QueueConfig, SyncHandler, SyncQueueManager};
pub use router::Router;
pub use strategy::{CACHE_STATUS_HEADER, CACHED_AT_HEADER, FALLBACK_HEADER, ResponseSource};

use strategy::{BucketCache, Outcome};

/// Name of the per-request duration sample in the performance tracker.
pub const REQUEST_DURATION_METRIC: &str = "request_duration_ms";

/// A request entering the edge cache.
#[derive(Debug, Clone)]
pub struct EdgeRequest {
    pub request: HttpRequest,
    /// Top-level document navigation. Unsatisfiable navigations are answered
    /// with the offline page.
    pub navigation: bool,
}

impl EdgeRequest {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            navigation: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpRequest::get(url))
    }

    /// A document navigation to `url`.
    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            request: HttpRequest::get(url),
            navigation: true,
        }
    }

    /// Navigation flag, or a `sec-fetch-mode: navigate` header.
    pub fn is_navigation(&self) -> bool {
        self.navigation
            || self
                .request
                .headers
                .get("sec-fetch-mode")
                .is_some_and(|mode| mode == "navigate")
    }
}

impl From<HttpRequest> for EdgeRequest {
    fn from(request: HttpRequest) -> Self {
        Self::new(request)
    }
}

/// A response produced by the edge cache.
#[derive(Debug, Clone)]
pub struct EdgeResponse {
    pub response: HttpResponse,
    pub source: ResponseSource,
    /// Bucket the request was classified into.
    pub bucket: String,
}

pub(crate) struct EdgeInner {
    pub config: EdgeConfig,
    pub router: Router,
    pub backend: Arc<dyn CacheBackend>,
    pub client: Arc<dyn HttpClient>,
    pub perf: PerformanceTracker,
    pub queue: Option<SyncQueueManager>,
}

/// Request router and multi-bucket cache. Cheap to clone.
#[derive(Clone)]
pub struct EdgeCache {
    pub(crate) inner: Arc<EdgeInner>,
}

impl EdgeCache {
    pub fn builder() -> EdgeCacheBuilder {
        EdgeCacheBuilder::new()
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn performance(&self) -> &PerformanceTracker {
        &self.inner.perf
    }

    /// The attached sync queue, if any.
    pub fn queue(&self) -> Option<&SyncQueueManager> {
        self.inner.queue.as_ref()
    }

    pub(crate) fn bucket(&self, name: &str) -> Result<BucketCache> {
        let config = self
            .inner
            .config
            .buckets
            .get(name)
            .ok_or_else(|| HuginnError::UnknownBucket(name.to_string()))?;
        Ok(BucketCache {
            name: name.to_string(),
            config: config.clone(),
            backend: Arc::clone(&self.inner.backend),
        })
    }

    /// Serve one request.
    ///
    /// Errors only escape for requests that are neither navigations nor API
    /// calls; everything else degrades to a fallback response.
    #[instrument(skip(self, request), fields(method = %request.request.method, url = %request.request.url))]
    pub async fn handle(&self, request: EdgeRequest) -> Result<EdgeResponse> {
        let started = Instant::now();
        let bucket = self.inner.router.classify(&request.request.url);
        let cache = self.bucket(&bucket)?;

        let result = if request.request.method.is_mutating() {
            self.forward_mutation(&request.request).await
        } else {
            strategy::execute(&cache, &self.inner.client, &request.request).await
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => self.error_fallback(&request, e)?,
        };

        self.record(&cache, outcome.source, started);
        debug!(bucket = %bucket, source = ?outcome.source, status = outcome.response.status, "served");
        Ok(EdgeResponse {
            response: outcome.response,
            source: outcome.source,
            bucket,
        })
    }

    /// Network-only path for mutating requests, queueing on transient failure.
    async fn forward_mutation(&self, request: &HttpRequest) -> Result<Outcome> {
        match self.inner.client.send(request.clone()).await {
            Ok(response) => Ok(Outcome {
                response,
                source: ResponseSource::Network,
            }),
            Err(e) if e.is_transient() => {
                let (Some(queue), Some(tag)) = (
                    self.inner.queue.as_ref(),
                    self.inner.router.replay_tag(&request.url),
                ) else {
                    return Err(e);
                };
                let (payload, options) = queued_mutation(request);
                let id = queue.enqueue(tag, payload, options).await?;
                warn!(tag, id = %id, error = %e, "mutation failed, queued for replay");
                let response = HttpResponse::json_body(
                    202,
                    &json!({ "queued": true, "id": id, "tag": tag }),
                )?;
                Ok(Outcome {
                    response,
                    source: ResponseSource::Queued,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn error_fallback(&self, request: &EdgeRequest, error: HuginnError) -> Result<Outcome> {
        // A definite answer from the server is passed through, not masked as offline.
        if let HuginnError::Server { status, body } = &error {
            if !error.is_transient() {
                return Ok(Outcome {
                    response: HttpResponse::new(*status, body.clone()),
                    source: ResponseSource::Network,
                });
            }
        }

        if request.is_navigation() {
            debug!(error = %error, "serving offline page");
            let response = HttpResponse::new(200, self.inner.config.offline_page.clone())
                .with_header("content-type", "text/html; charset=utf-8")
                .with_header(FALLBACK_HEADER, "true");
            return Ok(Outcome {
                response,
                source: ResponseSource::Fallback,
            });
        }

        if self.inner.router.is_api(&request.request.url) {
            debug!(error = %error, "serving offline API response");
            let response = HttpResponse::json_body(
                503,
                &json!({
                    "error": "offline",
                    "message": error.to_string(),
                    "offline": true,
                    "timestamp": now_millis(),
                }),
            )?
            .with_header(FALLBACK_HEADER, "true");
            return Ok(Outcome {
                response,
                source: ResponseSource::Fallback,
            });
        }

        Err(error)
    }

    fn record(&self, cache: &BucketCache, source: ResponseSource, started: Instant) {
        let elapsed = started.elapsed();
        let perf = &self.inner.perf;
        match source {
            ResponseSource::Cache => perf.record_hit(&cache.name),
            ResponseSource::Network | ResponseSource::Queued => perf.record_miss(&cache.name),
            ResponseSource::Fallback => {
                perf.record_miss(&cache.name);
                perf.record_fallback(&cache.name);
            }
        }
        perf.record(
            REQUEST_DURATION_METRIC,
            elapsed.as_secs_f64() * 1000.0,
            json!({ "bucket": cache.name, "source": source }),
        );
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "bucket" => cache.name.clone(),
            "strategy" => cache.config.strategy.as_str(),
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Queue payload and options for a failed mutation.
fn queued_mutation(request: &HttpRequest) -> (Value, EnqueueOptions) {
    let payload = request
        .body
        .as_deref()
        .map(|body| {
            serde_json::from_slice(body)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
        })
        .unwrap_or(Value::Null);

    let operation = match request.method {
        Method::Delete => Operation::Delete,
        Method::Put | Method::Patch => Operation::Update,
        _ => Operation::Create,
    };
    let mut options = EnqueueOptions::new().operation(operation);
    if operation != Operation::Create {
        let path = router::url_path(&request.url);
        if let Some(id) = path.rsplit('/').find(|s| !s.is_empty()) {
            options = options.record_id(id);
        }
    }
    (payload, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_detected_from_header() {
        let req = EdgeRequest::get("/").request.header("Sec-Fetch-Mode", "navigate");
        assert!(EdgeRequest::new(req).is_navigation());
        assert!(!EdgeRequest::get("/").is_navigation());
        assert!(EdgeRequest::navigate("/").is_navigation());
    }

    #[test]
    fn failed_update_keeps_record_id() {
        let req = HttpRequest::put("/api/evaluations/42?x=1")
            .json(&json!({"score": 3}))
            .unwrap();
        let (payload, options) = queued_mutation(&req);
        assert_eq!(payload, json!({"score": 3}));
        assert_eq!(options.operation, Operation::Update);
        assert_eq!(options.record_id.as_deref(), Some("42"));
    }

    #[test]
    fn failed_create_has_no_record_id() {
        let req = HttpRequest::post("/api/evaluations").json(&json!({})).unwrap();
        let (_, options) = queued_mutation(&req);
        assert_eq!(options.operation, Operation::Create);
        assert!(options.record_id.is_none());
    }
}
