//! Retry configuration, delay calculation, and the retrying client decorator.
//!
//! [`RetryingHttpClient`] wraps any [`HttpClient`] and retries transient
//! failures (as classified by [`HuginnError::is_transient()`]) with
//! exponential backoff. Permanent failures are returned immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use super::{HttpClient, HttpRequest, HttpResponse};
use crate::telemetry;
use crate::{HuginnError, Result};

/// Configuration for retry behaviour on transient errors.
///
/// ```rust
/// # use huginn::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 500ms.
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (0-indexed):
    /// `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Execute an async operation, retrying transient errors with backoff.
pub(crate) async fn with_retry<F, Fut, T>(config: &RetryConfig, label: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..config.max_attempts.max(1) {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() => {
                if attempt + 1 < config.max_attempts {
                    metrics::counter!(telemetry::RETRIES_TOTAL, "method" => label.to_owned())
                        .increment(1);
                    let delay = config.delay_for_attempt(attempt);
                    warn!(
                        method = label,
                        attempt = attempt + 1,
                        max_attempts = config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| HuginnError::Network("no attempts made".into())))
}

/// Decorator that wraps an [`HttpClient`] with retry logic.
pub struct RetryingHttpClient {
    inner: Arc<dyn HttpClient>,
    config: RetryConfig,
}

impl RetryingHttpClient {
    pub fn new(inner: Arc<dyn HttpClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl HttpClient for RetryingHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let label = request.method.as_str();
        with_retry(&self.config, label, || self.inner.send(request.clone())).await
    }
}
