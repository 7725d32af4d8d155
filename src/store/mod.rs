//! Local-first data stores.
//!
//! An [`OfflineStore`] applies every mutation to local storage first, so it
//! is visible to reads immediately, then queues it for push. A sync pass
//! pulls server changes since the last watermark, merges them under the
//! store's [`ConflictPolicy`], and pushes queued mutations.
//!
//! ```text
//! absent ──create──► pending ──push ok──► synced ──update──► pending ──push ok──► synced
//!                                            └──delete──► pending(deleted) ──push ok──► absent
//! ```
//!
//! Several stores are usually owned together by a [`StoreManager`].

mod admin;
mod conflict;
mod events;
mod manager;
mod record;
mod sync;

use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::net::{HttpClient, NoToken, TokenProvider};
use crate::storage::{Operation, QueueFilter, Storage, SyncQueueItem};
use crate::time::now_millis;
use crate::{HuginnError, Result};

pub use admin::{StoreExport, StoreStats};
pub use conflict::{Conflict, ConflictPolicy, Resolution, merge_fields};
pub use events::{StoreEvent, StoreOperation, SubscriptionId};
pub use manager::StoreManager;
pub use record::{LocalRecord, RecordMeta, SyncStatus, parse_timestamp};
pub use sync::SyncReport;

use events::Subscribers;
use record::entity_id;

/// Configuration of one store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoreConfig {
    /// Unique store name; also names the local object store.
    pub name: String,
    /// Sync endpoint path (e.g. `/api/evaluations`), resolved against the
    /// remote base URL.
    pub endpoint: String,
    /// Queued items pushed per batch (default: 10).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Coalescing window for mutation-triggered syncs (default: 1s).
    #[serde(
        rename = "debounce_ms",
        default = "default_debounce",
        with = "crate::config::duration_ms"
    )]
    pub debounce: Duration,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Entity field carrying the modification time (default: `lastModified`).
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    /// Entity field carrying the id (default: `id`).
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Retry budget of queued mutations (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size() -> usize {
    10
}

fn default_debounce() -> Duration {
    Duration::from_secs(1)
}

fn default_timestamp_field() -> String {
    "lastModified".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_max_retries() -> u32 {
    crate::storage::DEFAULT_MAX_RETRIES
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            batch_size: default_batch_size(),
            debounce: default_debounce(),
            conflict_policy: ConflictPolicy::default(),
            timestamp_field: default_timestamp_field(),
            id_field: default_id_field(),
            max_retries: default_max_retries(),
        }
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = window;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn timestamp_field(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = field.into();
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }
}

/// Collaborators shared by every store.
#[derive(Clone)]
pub struct StoreContext {
    pub storage: Arc<dyn Storage>,
    pub client: Arc<dyn HttpClient>,
    /// Base URL for sync endpoints.
    pub base_url: String,
    pub token: Arc<dyn TokenProvider>,
    pub connectivity: Connectivity,
}

impl StoreContext {
    /// Context with no authentication that assumes the host is online.
    pub fn new(
        storage: Arc<dyn Storage>,
        client: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            client,
            base_url: base_url.into(),
            token: Arc::new(NoToken),
            connectivity: Connectivity::online(),
        }
    }

    pub fn with_token(mut self, token: Arc<dyn TokenProvider>) -> Self {
        self.token = token;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

pub(crate) struct StoreInner {
    pub config: StoreConfig,
    pub ctx: StoreContext,
    pub subscribers: Subscribers,
    /// Number of sync passes currently running.
    pub in_flight: AtomicUsize,
    /// A sync was requested while a pass was running.
    pub resync: AtomicBool,
    /// Pending debounce timer. Holds only the sleep, never a running pass.
    pub debounce: Mutex<Option<JoinHandle<()>>>,
}

/// A local-first store. Cheap to clone.
#[derive(Clone)]
pub struct OfflineStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl OfflineStore {
    pub fn new(config: StoreConfig, ctx: StoreContext) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                ctx,
                subscribers: Subscribers::default(),
                in_flight: AtomicUsize::new(0),
                resync: AtomicBool::new(false),
                debounce: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Queue tag under which this store's mutations are stored.
    pub fn queue_tag(&self) -> String {
        format!("store:{}", self.inner.config.name)
    }

    pub(crate) fn setting_key(&self, suffix: &str) -> String {
        format!("store:{}:{suffix}", self.inner.config.name)
    }

    /// Create a record. An id is generated unless `data` carries one.
    pub async fn create(&self, data: Value) -> Result<Value> {
        let mut data = into_object(data)?;
        let id_field = &self.inner.config.id_field;
        let id = entity_id(&data, id_field).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if let Some(existing) = self.load(&id).await? {
            let state = if existing.meta.deleted { "is pending deletion" } else { "already exists" };
            return Err(HuginnError::InvalidInput(format!(
                "record {id} {state} in store '{}'",
                self.name()
            )));
        }

        let now = now_millis();
        data.insert(id_field.clone(), Value::String(id.clone()));
        data.insert(self.inner.config.timestamp_field.clone(), now.into());
        let record = LocalRecord::pending(id, data, Operation::Create, now);
        self.mutate(record, Operation::Create, StoreOperation::Create)
            .await
    }

    /// Shallow-merge `partial` over a record.
    pub async fn update(&self, id: &str, partial: Value) -> Result<Value> {
        let partial = into_object(partial)?;
        let mut record = self.load_visible(id).await?;

        let id_field = &self.inner.config.id_field;
        for (k, v) in partial {
            if k != *id_field {
                record.data.insert(k, v);
            }
        }
        let now = now_millis();
        record
            .data
            .insert(self.inner.config.timestamp_field.clone(), now.into());
        record.meta.last_modified = now;
        // A record never pushed stays a create from the server's view.
        let unpushed_create = record.is_pending() && record.meta.operation == Some(Operation::Create);
        if !unpushed_create {
            record.meta.operation = Some(Operation::Update);
        }
        record.meta.sync_status = SyncStatus::Pending;
        self.mutate(record, Operation::Update, StoreOperation::Update)
            .await
    }

    /// Soft-delete a record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut record = self.load_visible(id).await?;
        record.meta.deleted = true;
        record.meta.last_modified = now_millis();
        record.meta.operation = Some(Operation::Delete);
        record.meta.sync_status = SyncStatus::Pending;
        self.mutate(record, Operation::Delete, StoreOperation::Delete)
            .await?;
        Ok(())
    }

    /// Write locally, queue for push, notify, and schedule a sync.
    async fn mutate(
        &self,
        record: LocalRecord,
        operation: Operation,
        event: StoreOperation,
    ) -> Result<Value> {
        let entity = record.entity();
        self.save(&record).await?;
        self.enqueue(&record, operation).await?;
        self.emit(event, entity.clone());
        self.schedule_sync();
        Ok(entity)
    }

    /// Queue `record` for push as `operation`.
    pub(crate) async fn enqueue(&self, record: &LocalRecord, operation: Operation) -> Result<()> {
        let payload = match operation {
            Operation::Delete => {
                let mut key = Map::new();
                key.insert(
                    self.inner.config.id_field.clone(),
                    Value::String(record.id.clone()),
                );
                Value::Object(key)
            }
            _ => record.entity(),
        };
        let item = SyncQueueItem::new(self.queue_tag(), operation, payload)
            .record_id(record.id.clone())
            .max_retries(self.inner.config.max_retries);
        self.inner.ctx.storage.add_to_sync_queue(item).await?;
        debug!(store = %self.name(), id = %record.id, %operation, "local mutation queued");
        Ok(())
    }

    /// Drop every queued item for `id`.
    pub(crate) async fn drop_queued(&self, id: &str) -> Result<usize> {
        let items = self.queued(Some(id)).await?;
        for item in &items {
            self.inner.ctx.storage.remove_sync_item(&item.id).await?;
        }
        Ok(items.len())
    }

    /// A visible record, without bookkeeping.
    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        Ok(self
            .load(id)
            .await?
            .filter(|r| !r.meta.deleted)
            .map(|r| r.entity()))
    }

    /// Every visible record, ordered by id.
    pub async fn get_all(&self) -> Result<Vec<Value>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| !r.meta.deleted)
            .map(|r| r.entity())
            .collect())
    }

    /// Visible records with a string field containing `query`, ignoring case.
    pub async fn search(&self, query: &str) -> Result<Vec<Value>> {
        let needle = query.to_lowercase();
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| !r.meta.deleted && r.matches(&needle))
            .map(|r| r.entity())
            .collect())
    }

    /// The full local record including bookkeeping, deleted or not.
    pub async fn record(&self, id: &str) -> Result<Option<LocalRecord>> {
        self.load(id).await
    }

    /// Register a change callback.
    pub fn subscribe(&self, callback: impl Fn(&StoreEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.inner.subscribers.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    pub(crate) fn emit(&self, operation: StoreOperation, data: Value) {
        self.inner.subscribers.emit(&StoreEvent {
            store: self.inner.config.name.clone(),
            operation,
            data,
        });
    }

    /// Start a sync after the debounce window, replacing any pending timer.
    /// A pass that has already started is left to finish. Does nothing while
    /// offline.
    pub fn schedule_sync(&self) {
        if !self.inner.ctx.connectivity.is_online() {
            return;
        }
        let Ok(mut pending) = self.inner.debounce.lock() else {
            return;
        };
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let store = self.clone();
        let window = self.inner.config.debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Detached so that aborting the timer cannot cancel the pass.
            tokio::spawn(async move {
                if let Err(e) = store.sync(false).await {
                    warn!(store = %store.name(), error = %e, "scheduled sync failed");
                }
            });
        }));
    }

    /// Schedule a sync on every offline→online transition.
    ///
    /// The listener holds the store weakly and stops once it is dropped.
    pub fn spawn_online_listener(&self) -> JoinHandle<()> {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let mut watch = self.inner.ctx.connectivity.subscribe();
        tokio::spawn(async move {
            while watch.next_online().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let store = OfflineStore { inner };
                info!(store = %store.name(), "back online, scheduling sync");
                store.schedule_sync();
            }
        })
    }

    pub(crate) async fn load(&self, id: &str) -> Result<Option<LocalRecord>> {
        match self.inner.ctx.storage.get(self.name(), id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn load_visible(&self, id: &str) -> Result<LocalRecord> {
        self.load(id)
            .await?
            .filter(|r| !r.meta.deleted)
            .ok_or_else(|| HuginnError::not_found(self.name(), id))
    }

    pub(crate) async fn load_all(&self) -> Result<Vec<LocalRecord>> {
        self.inner
            .ctx
            .storage
            .get_all(self.name())
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(HuginnError::from))
            .collect()
    }

    pub(crate) async fn save(&self, record: &LocalRecord) -> Result<()> {
        self.inner
            .ctx
            .storage
            .put(self.name(), &record.id, serde_json::to_value(record)?)
            .await
    }

    /// Queued items of this store, optionally for one record.
    pub(crate) async fn queued(&self, record_id: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        let mut filter = QueueFilter::new().tag(self.queue_tag());
        if let Some(id) = record_id {
            filter = filter.record_id(id);
        }
        self.inner.ctx.storage.sync_queue(&filter).await
    }
}

pub(crate) fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(HuginnError::InvalidInput(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}
