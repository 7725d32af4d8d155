//! Bucket, routing, and replay configuration for the edge cache.
//!
//! Configuration is plain data passed into [`EdgeCache`](super::EdgeCache)
//! at construction; there are no global registries. All structs deserialize
//! from TOML (durations in milliseconds):
//!
//! ```toml
//! [edge.buckets.api]
//! strategy = "network-first"
//! max_age_ms = 300000
//! max_entries = 50
//! network_timeout_ms = 10000
//!
//! [[edge.routes]]
//! pattern = "^/api/"
//! bucket = "api"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_ms, opt_duration_ms};
use crate::{HuginnError, Result};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Ordering policy between cache and network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Serve fresh cache entries without touching the network.
    CacheFirst,
    /// Prefer the network; fall back to any cached entry on failure.
    NetworkFirst,
    /// Serve fresh cache immediately and refresh it in the background.
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::CacheFirst => "cache-first",
            Strategy::NetworkFirst => "network-first",
            Strategy::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Policy for one cache bucket.
///
/// ```rust
/// # use huginn::edge::{BucketConfig, Strategy};
/// # use std::time::Duration;
/// let api = BucketConfig::new(Strategy::NetworkFirst)
///     .max_age(Duration::from_secs(300))
///     .max_entries(50)
///     .network_timeout(Duration::from_secs(10));
/// assert_eq!(api.max_entries, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub strategy: Strategy,
    /// How long a stored entry counts as fresh.
    #[serde(rename = "max_age_ms", with = "duration_ms")]
    pub max_age: Duration,
    /// Entry limit; the oldest entries are evicted first.
    pub max_entries: usize,
    /// Upper bound on the network leg (network-first only).
    #[serde(rename = "network_timeout_ms", default, with = "opt_duration_ms")]
    pub network_timeout: Option<Duration>,
}

impl BucketConfig {
    /// A bucket with one day max-age and 100 entries.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            max_age: Duration::from_secs(DAY),
            max_entries: 100,
            network_timeout: None,
        }
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = Some(timeout);
        self
    }
}

/// URL path pattern → bucket mapping. Rules are tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteRule {
    /// Regular expression matched against the URL path.
    pub pattern: String,
    pub bucket: String,
}

impl RouteRule {
    pub fn new(pattern: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            bucket: bucket.into(),
        }
    }
}

/// Mutating requests whose path matches `pattern` are queued under `tag`
/// when the network is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplayRoute {
    pub pattern: String,
    pub tag: String,
}

impl ReplayRoute {
    pub fn new(pattern: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            tag: tag.into(),
        }
    }
}

/// Edge cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub buckets: BTreeMap<String, BucketConfig>,
    /// Priority-ordered classification rules.
    pub routes: Vec<RouteRule>,
    /// Bucket for URLs no rule matches.
    pub default_bucket: String,
    /// Path prefix identifying API requests (structured 503 fallback).
    pub api_prefix: String,
    pub replay_routes: Vec<ReplayRoute>,
    /// Capacity of the memoized URL → bucket classification cache.
    pub classification_cache_size: u64,
    /// Interval of the background expiry sweep.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Samples kept per performance metric.
    pub metrics_capacity: usize,
    /// HTML served to navigation requests that cannot be satisfied.
    pub offline_page: String,
}

pub const DEFAULT_OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Offline</title></head>
<body>
<h1>You are offline</h1>
<p>This page is not available without a network connection. Changes you make
are saved on this device and will sync when you reconnect.</p>
</body>
</html>
"#;

impl Default for EdgeConfig {
    fn default() -> Self {
        let buckets = [
            (
                "static",
                BucketConfig::new(Strategy::CacheFirst)
                    .max_age(Duration::from_secs(30 * DAY))
                    .max_entries(100),
            ),
            (
                "runtime",
                BucketConfig::new(Strategy::NetworkFirst)
                    .max_age(Duration::from_secs(DAY))
                    .max_entries(50)
                    .network_timeout(Duration::from_secs(5)),
            ),
            (
                "api",
                BucketConfig::new(Strategy::NetworkFirst)
                    .max_age(Duration::from_secs(5 * MINUTE))
                    .max_entries(50)
                    .network_timeout(Duration::from_secs(10)),
            ),
            (
                "images",
                BucketConfig::new(Strategy::CacheFirst)
                    .max_age(Duration::from_secs(7 * DAY))
                    .max_entries(200),
            ),
            (
                "i18n",
                BucketConfig::new(Strategy::StaleWhileRevalidate)
                    .max_age(Duration::from_secs(DAY))
                    .max_entries(20),
            ),
            (
                "documents",
                BucketConfig::new(Strategy::CacheFirst)
                    .max_age(Duration::from_secs(7 * DAY))
                    .max_entries(30),
            ),
            (
                "fonts",
                BucketConfig::new(Strategy::CacheFirst)
                    .max_age(Duration::from_secs(365 * DAY))
                    .max_entries(30),
            ),
        ]
        .into_iter()
        .map(|(name, config)| (name.to_string(), config))
        .collect();

        let routes = vec![
            RouteRule::new(r"^/(locales|i18n)/", "i18n"),
            RouteRule::new(r"^/api/", "api"),
            RouteRule::new(r"(?i)\.(png|jpe?g|gif|svg|webp|avif|ico)$", "images"),
            RouteRule::new(r"(?i)\.(woff2?|ttf|otf|eot)$", "fonts"),
            RouteRule::new(r"(?i)\.(pdf|docx?|xlsx?|pptx?|csv)$", "documents"),
            RouteRule::new(r"(?i)(^/$|\.(m?js|css|html?|wasm|map)$)", "static"),
        ];

        let replay_routes = vec![
            ReplayRoute::new(r"^/api/evaluations", "evaluation-sync"),
            ReplayRoute::new(r"^/api/beneficiaries", "beneficiary-sync"),
            ReplayRoute::new(r"^/api/documents", "document-upload"),
            ReplayRoute::new(r"^/api/notifications", "notification-sync"),
            ReplayRoute::new(r"^/api/analytics", "analytics-sync"),
        ];

        Self {
            buckets,
            routes,
            default_bucket: "runtime".to_string(),
            api_prefix: "/api/".to_string(),
            replay_routes,
            classification_cache_size: 1_000,
            sweep_interval: Duration::from_secs(HOUR),
            metrics_capacity: 100,
            offline_page: DEFAULT_OFFLINE_PAGE.to_string(),
        }
    }
}

impl EdgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bucket.
    pub fn bucket(mut self, name: impl Into<String>, config: BucketConfig) -> Self {
        self.buckets.insert(name.into(), config);
        self
    }

    /// Prepend a route, giving it the highest priority.
    pub fn route(mut self, pattern: impl Into<String>, bucket: impl Into<String>) -> Self {
        self.routes.insert(0, RouteRule::new(pattern, bucket));
        self
    }

    pub fn default_bucket(mut self, name: impl Into<String>) -> Self {
        self.default_bucket = name.into();
        self
    }

    pub fn replay_route(mut self, pattern: impl Into<String>, tag: impl Into<String>) -> Self {
        self.replay_routes.push(ReplayRoute::new(pattern, tag));
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn offline_page(mut self, html: impl Into<String>) -> Self {
        self.offline_page = html.into();
        self
    }

    /// Check that every referenced bucket exists.
    pub fn validate(&self) -> Result<()> {
        if !self.buckets.contains_key(&self.default_bucket) {
            return Err(HuginnError::Configuration(format!(
                "default bucket '{}' is not configured",
                self.default_bucket
            )));
        }
        if let Some(rule) = self
            .routes
            .iter()
            .find(|r| !self.buckets.contains_key(&r.bucket))
        {
            return Err(HuginnError::Configuration(format!(
                "route '{}' targets unknown bucket '{}'",
                rule.pattern, rule.bucket
            )));
        }
        Ok(())
    }
}
