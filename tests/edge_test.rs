//! Edge cache behaviour: strategies, eviction, and offline fallbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huginn::edge::{
    BucketConfig, CACHE_STATUS_HEADER, EdgeCache, EdgeConfig, EdgeRequest, FALLBACK_HEADER,
    ResponseSource, Strategy, SyncQueueManager,
};
use huginn::net::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
use huginn::storage::{QueueFilter, SyncQueueStore};
use huginn::{HuginnError, Result, SnapshotStorage};

// ============================================================================
// Mock network
// ============================================================================

/// Serves `body` for every URL, counting calls. Can be switched offline or
/// made to answer with an error status.
#[derive(Default)]
struct MockNetwork {
    calls: AtomicU32,
    offline: AtomicBool,
    status: Mutex<HashMap<String, u16>>,
}

impl MockNetwork {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn respond_with(&self, url: &str, status: u16) {
        self.status.lock().unwrap().insert(url.to_string(), status);
    }
}

#[async_trait]
impl HttpClient for MockNetwork {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.offline.load(Ordering::SeqCst) {
            return Err(HuginnError::Network("connection refused".into()));
        }
        let status = self
            .status
            .lock()
            .unwrap()
            .get(&request.url)
            .copied()
            .unwrap_or(200);
        HttpResponse::new(status, format!("{} #{n}", request.url)).error_for_status()
    }
}

fn cache_with(network: &Arc<MockNetwork>, config: EdgeConfig) -> EdgeCache {
    EdgeCache::builder()
        .config(config)
        .client(network.clone())
        .build()
        .unwrap()
}

fn cache(network: &Arc<MockNetwork>) -> EdgeCache {
    cache_with(network, EdgeConfig::default())
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn requests_are_classified_into_buckets() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    for (url, bucket) in [
        ("/app.js", "static"),
        ("/api/dashboard/stats", "api"),
        ("/img/logo.png", "images"),
        ("/locales/fr.json", "i18n"),
        ("/fonts/inter.woff2", "fonts"),
        ("/reports/q3.pdf", "documents"),
        ("/beneficiaries/12", "runtime"),
    ] {
        let response = cache.handle(EdgeRequest::get(url)).await.unwrap();
        assert_eq!(response.bucket, bucket, "{url}");
    }
}

// ============================================================================
// Strategies
// ============================================================================

#[tokio::test]
async fn cache_first_serves_fresh_entries_without_network() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    let first = cache.handle(EdgeRequest::get("/app.js")).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(first.response.header(CACHE_STATUS_HEADER), Some("MISS"));

    let second = cache.handle(EdgeRequest::get("/app.js")).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.header(CACHE_STATUS_HEADER), Some("HIT"));
    assert_eq!(second.response.text(), first.response.text());
    assert_eq!(network.calls(), 1);
}

#[tokio::test]
async fn cache_first_refetches_expired_entries() {
    let network = Arc::new(MockNetwork::default());
    let config = EdgeConfig::default().bucket(
        "static",
        BucketConfig::new(Strategy::CacheFirst).max_age(Duration::from_millis(20)),
    );
    let cache = cache_with(&network, config);

    cache.handle(EdgeRequest::get("/app.js")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let again = cache.handle(EdgeRequest::get("/app.js")).await.unwrap();

    assert_eq!(again.source, ResponseSource::Network);
    assert_eq!(network.calls(), 2);
}

#[tokio::test]
async fn network_first_prefers_network_and_falls_back_to_cache() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    let online = cache
        .handle(EdgeRequest::get("/api/dashboard/stats"))
        .await
        .unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    let refreshed = cache
        .handle(EdgeRequest::get("/api/dashboard/stats"))
        .await
        .unwrap();
    assert_eq!(refreshed.source, ResponseSource::Network);
    assert_eq!(network.calls(), 2);

    network.set_offline(true);
    let offline = cache
        .handle(EdgeRequest::get("/api/dashboard/stats"))
        .await
        .unwrap();
    assert_eq!(offline.source, ResponseSource::Fallback);
    assert_eq!(offline.response.status, 200);
    assert_eq!(offline.response.header(FALLBACK_HEADER), Some("true"));
    assert_eq!(offline.response.text(), refreshed.response.text());
}

#[tokio::test]
async fn network_first_falls_back_to_expired_entries() {
    let network = Arc::new(MockNetwork::default());
    let config = EdgeConfig::default().bucket(
        "api",
        BucketConfig::new(Strategy::NetworkFirst).max_age(Duration::from_millis(1)),
    );
    let cache = cache_with(&network, config);

    cache.handle(EdgeRequest::get("/api/items")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    network.set_offline(true);

    let response = cache.handle(EdgeRequest::get("/api/items")).await.unwrap();
    assert_eq!(response.source, ResponseSource::Fallback);
}

/// Network-first buckets with a 100ms budget, served over real HTTP.
fn timed_cache(server: &MockServer) -> (EdgeCache, String) {
    let bucket = BucketConfig::new(Strategy::NetworkFirst).network_timeout(Duration::from_millis(100));
    let config = EdgeConfig::default()
        .bucket("api", bucket.clone())
        .bucket("reports", bucket)
        .route(r"^/reports/", "reports");
    let cache = EdgeCache::builder()
        .config(config)
        .client(Arc::new(ReqwestClient::new().unwrap()))
        .build()
        .unwrap();
    (cache, server.uri())
}

async fn slow_get(server: &MockServer, route: &str) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(server)
        .await;
}

#[tokio::test]
async fn network_first_timeout_serves_cached_copy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/dashboard/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    slow_get(&server, "/api/dashboard/stats").await;
    let (cache, base) = timed_cache(&server);
    let url = format!("{base}/api/dashboard/stats");

    let first = cache.handle(EdgeRequest::get(&url)).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let started = Instant::now();
    let slow = cache.handle(EdgeRequest::get(&url)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(slow.source, ResponseSource::Fallback);
    assert_eq!(slow.response.header(FALLBACK_HEADER), Some("true"));
    assert_eq!(slow.response.text(), "fresh");
}

#[tokio::test]
async fn network_first_timeout_without_cache() {
    let server = MockServer::start().await;
    slow_get(&server, "/api/items").await;
    slow_get(&server, "/reports/q1.pdf").await;
    let (cache, base) = timed_cache(&server);

    // API requests degrade to the offline JSON answer.
    let started = Instant::now();
    let api = cache
        .handle(EdgeRequest::get(format!("{base}/api/items")))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(api.response.status, 503);
    assert_eq!(api.response.json::<Value>().unwrap()["offline"], true);

    // Anything else surfaces the timeout.
    let started = Instant::now();
    let err = cache
        .handle(EdgeRequest::get(format!("{base}/reports/q1.pdf")))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, HuginnError::Timeout(limit) if limit == Duration::from_millis(100)));
}

#[tokio::test]
async fn stale_while_revalidate_serves_cache_and_refreshes() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    let first = cache.handle(EdgeRequest::get("/locales/en.json")).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    let second = cache.handle(EdgeRequest::get("/locales/en.json")).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.text(), first.response.text());

    // Let the background refresh land.
    for _ in 0..50 {
        if network.calls() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(network.calls(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let third = cache.handle(EdgeRequest::get("/locales/en.json")).await.unwrap();
    assert_eq!(third.source, ResponseSource::Cache);
    assert!(third.response.text().ends_with("#2"));
}

// ============================================================================
// Eviction and maintenance
// ============================================================================

#[tokio::test]
async fn oldest_entries_are_evicted_at_capacity() {
    let network = Arc::new(MockNetwork::default());
    let config = EdgeConfig::default().bucket(
        "static",
        BucketConfig::new(Strategy::CacheFirst).max_entries(2),
    );
    let cache = cache_with(&network, config);

    for url in ["/a.js", "/b.js", "/c.js"] {
        cache.handle(EdgeRequest::get(url)).await.unwrap();
    }
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.buckets["static"].entries, 2);

    // `/a.js` was evicted; `/c.js` is still cached.
    cache.handle(EdgeRequest::get("/c.js")).await.unwrap();
    assert_eq!(network.calls(), 3);
    cache.handle(EdgeRequest::get("/a.js")).await.unwrap();
    assert_eq!(network.calls(), 4);
}

#[tokio::test]
async fn zero_capacity_bucket_never_stores() {
    let network = Arc::new(MockNetwork::default());
    let config = EdgeConfig::default().bucket(
        "static",
        BucketConfig::new(Strategy::CacheFirst).max_entries(0),
    );
    let cache = cache_with(&network, config);

    cache.handle(EdgeRequest::get("/a.js")).await.unwrap();
    cache.handle(EdgeRequest::get("/a.js")).await.unwrap();
    assert_eq!(network.calls(), 2);
}

#[tokio::test]
async fn sweep_removes_expired_entries() {
    let network = Arc::new(MockNetwork::default());
    let config = EdgeConfig::default().bucket(
        "static",
        BucketConfig::new(Strategy::CacheFirst).max_age(Duration::from_millis(5)),
    );
    let cache = cache_with(&network, config);

    cache.handle(EdgeRequest::get("/a.js")).await.unwrap();
    cache.handle(EdgeRequest::get("/img/x.png")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(cache.sweep_expired().await.unwrap(), 1);
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.buckets["static"].entries, 0);
    assert_eq!(stats.buckets["images"].entries, 1);
}

#[tokio::test]
async fn warm_and_clear() {
    let network = Arc::new(MockNetwork::default());
    network.respond_with("/missing.js", 404);
    let cache = cache(&network);

    let results = cache
        .warm(&["/a.js".to_string(), "/missing.js".to_string()])
        .await;
    assert!(results[0].success);
    assert_eq!(results[0].bucket, "static");
    assert!(!results[1].success);
    assert!(results[1].error.is_some());

    let hit = cache.handle(EdgeRequest::get("/a.js")).await.unwrap();
    assert_eq!(hit.source, ResponseSource::Cache);

    cache.clear_bucket("static").await.unwrap();
    assert_eq!(cache.stats().await.unwrap().total_entries, 0);
    assert!(matches!(
        cache.clear_bucket("nope").await,
        Err(HuginnError::UnknownBucket(_))
    ));
}

// ============================================================================
// Fallbacks
// ============================================================================

#[tokio::test]
async fn uncached_api_request_gets_offline_json() {
    let network = Arc::new(MockNetwork::default());
    network.set_offline(true);
    let cache = cache(&network);

    let response = cache
        .handle(EdgeRequest::get("/api/dashboard/stats"))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.response.status, 503);
    let body: Value = response.response.json().unwrap();
    assert_eq!(body["error"], "offline");
    assert_eq!(body["offline"], true);
    assert!(body["timestamp"].as_u64().is_some());
}

#[tokio::test]
async fn navigation_gets_offline_page() {
    let network = Arc::new(MockNetwork::default());
    network.set_offline(true);
    let config = EdgeConfig::default().offline_page("<h1>offline</h1>");
    let cache = cache_with(&network, config);

    let response = cache
        .handle(EdgeRequest::navigate("/beneficiaries/7"))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Fallback);
    assert_eq!(response.response.status, 200);
    assert_eq!(response.response.text(), "<h1>offline</h1>");
    assert!(
        response
            .response
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("text/html"))
    );
}

#[tokio::test]
async fn other_failures_propagate() {
    let network = Arc::new(MockNetwork::default());
    network.set_offline(true);
    let cache = cache(&network);

    let err = cache.handle(EdgeRequest::get("/app.js")).await.unwrap_err();
    assert!(matches!(err, HuginnError::Network(_)));
}

#[tokio::test]
async fn definite_server_errors_pass_through() {
    let network = Arc::new(MockNetwork::default());
    network.respond_with("/api/missing", 404);
    let cache = cache(&network);

    let response = cache.handle(EdgeRequest::get("/api/missing")).await.unwrap();
    assert_eq!(response.response.status, 404);
    assert_eq!(response.source, ResponseSource::Network);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn failed_mutation_is_queued_for_replay() {
    let network = Arc::new(MockNetwork::default());
    network.set_offline(true);
    let storage = Arc::new(SnapshotStorage::in_memory());
    let queue = SyncQueueManager::new(storage.clone());
    let cache = EdgeCache::builder()
        .client(network.clone())
        .queue(queue)
        .build()
        .unwrap();

    let request = HttpRequest::put("/api/evaluations/42")
        .json(&json!({"score": 4}))
        .unwrap();
    let response = cache.handle(EdgeRequest::new(request)).await.unwrap();

    assert_eq!(response.source, ResponseSource::Queued);
    assert_eq!(response.response.status, 202);
    let body: Value = response.response.json().unwrap();
    assert_eq!(body["queued"], true);
    assert_eq!(body["tag"], "evaluation-sync");

    let queued = storage
        .sync_queue(&QueueFilter::new().tag("evaluation-sync"))
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].record_id.as_deref(), Some("42"));
    assert_eq!(queued[0].payload, json!({"score": 4}));
    assert_eq!(body["id"], queued[0].id.as_str());
}

#[tokio::test]
async fn mutations_are_never_cached() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    let request = HttpRequest::post("/api/evaluations").json(&json!({})).unwrap();
    cache.handle(EdgeRequest::new(request.clone())).await.unwrap();
    cache.handle(EdgeRequest::new(request)).await.unwrap();

    assert_eq!(network.calls(), 2);
    assert_eq!(cache.stats().await.unwrap().buckets["api"].entries, 0);
}

#[tokio::test]
async fn mutation_without_queue_surfaces_offline_json() {
    let network = Arc::new(MockNetwork::default());
    network.set_offline(true);
    let cache = cache(&network);

    let request = HttpRequest::post("/api/evaluations").json(&json!({})).unwrap();
    let response = cache.handle(EdgeRequest::new(request)).await.unwrap();
    assert_eq!(response.response.status, 503);
}

// ============================================================================
// Accounting
// ============================================================================

#[tokio::test]
async fn hits_misses_and_fallbacks_are_counted() {
    let network = Arc::new(MockNetwork::default());
    let cache = cache(&network);

    cache.handle(EdgeRequest::get("/app.js")).await.unwrap();
    cache.handle(EdgeRequest::get("/app.js")).await.unwrap();
    cache.handle(EdgeRequest::get("/api/x")).await.unwrap();
    network.set_offline(true);
    cache.handle(EdgeRequest::get("/api/x")).await.unwrap();

    let stats = cache.stats().await.unwrap();
    let static_stats = &stats.buckets["static"];
    assert_eq!((static_stats.hits, static_stats.misses), (1, 1));
    assert!((static_stats.hit_rate - 0.5).abs() < f64::EPSILON);
    let api = &stats.buckets["api"];
    assert_eq!((api.hits, api.misses, api.fallbacks), (0, 2, 1));

    let samples = cache
        .performance()
        .samples(huginn::edge::REQUEST_DURATION_METRIC);
    assert_eq!(samples.len(), 4);
}
