//! Durable sync queue with tag-dispatched replay.
//!
//! Mutating actions that must eventually reach the network are persisted
//! through [`SyncQueueStore`] and replayed by the [`SyncHandler`] registered
//! for their tag. Replay happens on explicit [`SyncQueueManager::drain`]
//! calls, on offline→online transitions
//! ([`SyncQueueManager::spawn_replay_on_reconnect`]), or periodically.
//!
//! # Retry lifecycle
//!
//! ```text
//! enqueue ──► queued ──drain ok──► removed
//!               │
//!               └─drain err──► retry_count += 1 ──(≥ max_retries)──► dead letter
//! ```
//!
//! Dead letters are never dropped automatically. Inspect them with
//! [`SyncQueueManager::dead_letters`] and either [`requeue`](SyncQueueManager::requeue)
//! or [`purge`](SyncQueueManager::purge) them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::connectivity::{Connectivity, ReplayRegistrar};
use crate::storage::{
    DEFAULT_MAX_RETRIES, Operation, Priority, QueueFilter, SyncQueueItem, SyncQueueStore,
};
use crate::telemetry;
use crate::{HuginnError, Result};

/// Replays queued items of one tag against the network.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn replay(&self, item: &SyncQueueItem) -> Result<()>;
}

/// Per-item options for [`SyncQueueManager::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub operation: Operation,
    pub record_id: Option<String>,
    pub max_retries: Option<u32>,
    pub priority: Priority,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            operation: Operation::Create,
            record_id: None,
            max_retries: None,
            priority: Priority::Normal,
        }
    }
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Queue manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry budget for items enqueued without an explicit one.
    pub default_max_retries: u32,
    /// Interval of the periodic drain, if enabled.
    #[serde(rename = "drain_interval_ms", with = "crate::config::opt_duration_ms")]
    pub drain_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            drain_interval: Some(Duration::from_secs(5 * 60)),
        }
    }
}

/// Outcome of one drain pass over a tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub tag: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Items whose failure in this pass spent their retry budget.
    pub exhausted: usize,
    /// Another drain of the same tag was already running.
    pub skipped: bool,
}

struct QueueInner {
    storage: Arc<dyn SyncQueueStore>,
    config: QueueConfig,
    handlers: RwLock<HashMap<String, Arc<dyn SyncHandler>>>,
    registrar: Option<Arc<dyn ReplayRegistrar>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Owner of the durable sync queue. Cheap to clone.
#[derive(Clone)]
pub struct SyncQueueManager {
    inner: Arc<QueueInner>,
}

impl SyncQueueManager {
    pub fn new(storage: Arc<dyn SyncQueueStore>) -> Self {
        Self::with_config(storage, QueueConfig::default())
    }

    pub fn with_config(storage: Arc<dyn SyncQueueStore>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                storage,
                config,
                handlers: RwLock::new(HashMap::new()),
                registrar: None,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach a platform replay registrar. Must be called before cloning.
    pub fn with_registrar(mut self, registrar: Arc<dyn ReplayRegistrar>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.registrar = Some(registrar);
        } else {
            warn!("replay registrar ignored: queue manager already shared");
        }
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Register (or replace) the handler for `tag`.
    pub fn register_handler(&self, tag: impl Into<String>, handler: Arc<dyn SyncHandler>) {
        let tag = tag.into();
        debug!(tag = %tag, "registered sync handler");
        if let Ok(mut handlers) = self.inner.handlers.write() {
            handlers.insert(tag, handler);
        }
    }

    /// Tags with a registered handler, sorted.
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .inner
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    fn handler(&self, tag: &str) -> Option<Arc<dyn SyncHandler>> {
        self.inner
            .handlers
            .read()
            .ok()
            .and_then(|h| h.get(tag).cloned())
    }

    /// Persist an item, then best-effort register a replay trigger.
    #[instrument(skip(self, payload, options), fields(tag = %tag))]
    pub async fn enqueue(&self, tag: &str, payload: Value, options: EnqueueOptions) -> Result<String> {
        let mut item = SyncQueueItem::new(tag, options.operation, payload)
            .max_retries(
                options
                    .max_retries
                    .unwrap_or(self.inner.config.default_max_retries),
            )
            .priority(options.priority);
        item.record_id = options.record_id;

        let id = self.inner.storage.add_to_sync_queue(item).await?;
        metrics::counter!(telemetry::SYNC_QUEUE_ENQUEUED_TOTAL, "tag" => tag.to_owned())
            .increment(1);
        info!(id = %id, "queued sync item");

        if let Some(registrar) = &self.inner.registrar {
            if let Err(e) = registrar.register(tag).await {
                warn!(error = %e, "replay registration failed; relying on explicit drains");
            }
        }
        Ok(id)
    }

    /// Replay every retryable item of `tag`.
    ///
    /// Fails with [`HuginnError::UnknownTag`] if no handler is registered,
    /// leaving the items untouched. Concurrent drains of the same tag are
    /// collapsed: the second returns a report with `skipped` set.
    #[instrument(skip(self), fields(tag = %tag))]
    pub async fn drain(&self, tag: &str) -> Result<DrainReport> {
        let handler = self
            .handler(tag)
            .ok_or_else(|| HuginnError::UnknownTag(tag.to_string()))?;

        let gate = self.gate(tag)?;
        let Ok(_guard) = gate.try_lock() else {
            debug!("drain already in flight");
            return Ok(DrainReport {
                tag: tag.to_string(),
                skipped: true,
                ..Default::default()
            });
        };

        let mut items = self
            .inner
            .storage
            .sync_queue(&QueueFilter::new().tag(tag).retryable())
            .await?;
        // Stable sort keeps enqueue order within a priority.
        items.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut report = DrainReport {
            tag: tag.to_string(),
            ..Default::default()
        };
        for item in items {
            report.attempted += 1;
            match handler.replay(&item).await {
                Ok(()) => {
                    self.inner.storage.remove_sync_item(&item.id).await?;
                    report.succeeded += 1;
                    Self::record_replay(tag, true);
                }
                Err(e) => {
                    report.failed += 1;
                    Self::record_replay(tag, false);
                    let updated = self
                        .inner
                        .storage
                        .update_sync_item_retry(&item.id, Some(e.to_string()))
                        .await?;
                    let exhausted = updated.as_ref().is_some_and(SyncQueueItem::is_exhausted);
                    if exhausted {
                        report.exhausted += 1;
                    }
                    warn!(
                        id = %item.id,
                        retry_count = updated.map_or(item.retry_count + 1, |u| u.retry_count),
                        max_retries = item.max_retries,
                        exhausted,
                        error = %e,
                        "sync replay failed"
                    );
                }
            }
        }

        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "drained sync queue"
            );
        }
        Ok(report)
    }

    /// Drain every tag that has a registered handler.
    pub async fn drain_all(&self) -> Vec<(String, Result<DrainReport>)> {
        let mut results = Vec::new();
        for tag in self.tags() {
            let result = self.drain(&tag).await;
            results.push((tag, result));
        }
        results
    }

    /// Queued items, optionally restricted to one tag.
    pub async fn pending(&self, tag: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        let mut filter = QueueFilter::new();
        if let Some(tag) = tag {
            filter = filter.tag(tag);
        }
        self.inner.storage.sync_queue(&filter).await
    }

    /// Items whose retry budget is spent.
    pub async fn dead_letters(&self, tag: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        let mut filter = QueueFilter::new().exhausted();
        if let Some(tag) = tag {
            filter = filter.tag(tag);
        }
        self.inner.storage.sync_queue(&filter).await
    }

    /// Remove an item permanently.
    pub async fn purge(&self, id: &str) -> Result<bool> {
        let removed = self.inner.storage.remove_sync_item(id).await?;
        if removed {
            info!(id, "purged sync item");
        }
        Ok(removed)
    }

    /// Give an item a fresh retry budget.
    pub async fn requeue(&self, id: &str) -> Result<bool> {
        self.inner.storage.reset_sync_item(id).await
    }

    /// Drain all tags whenever connectivity returns.
    pub fn spawn_replay_on_reconnect(&self, connectivity: &Connectivity) -> JoinHandle<()> {
        let manager = self.clone();
        let mut watch = connectivity.subscribe();
        tokio::spawn(async move {
            while watch.next_online().await {
                info!("back online, replaying sync queue");
                manager.log_drain_all().await;
            }
        })
    }

    /// Drain all tags every `interval` while `connectivity` reports online.
    pub fn spawn_periodic_drain(
        &self,
        interval: Duration,
        connectivity: Connectivity,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if connectivity.is_online() {
                    manager.log_drain_all().await;
                }
            }
        })
    }

    async fn log_drain_all(&self) {
        for (tag, result) in self.drain_all().await {
            if let Err(e) = result {
                warn!(tag = %tag, error = %e, "drain failed");
            }
        }
    }

    fn gate(&self, tag: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .map_err(|e| HuginnError::Storage(format!("lock poisoned: {e}")))?;
        Ok(Arc::clone(in_flight.entry(tag.to_string()).or_default()))
    }

    fn record_replay(tag: &str, ok: bool) {
        let status = if ok { "ok" } else { "error" };
        metrics::counter!(telemetry::SYNC_QUEUE_REPLAYED_TOTAL,
            "tag" => tag.to_owned(),
            "status" => status,
        )
        .increment(1);
    }
}
