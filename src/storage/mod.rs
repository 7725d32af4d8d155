//! Persistent storage boundary.
//!
//! Three narrow traits describe what the engine needs from durable storage:
//!
//! - [`RecordStore`]: key/value object stores holding local records.
//! - [`SyncQueueStore`]: the durable FIFO of not-yet-confirmed operations,
//!   shared by the edge queue manager and the local-first stores.
//! - [`SettingsStore`]: small key/value settings (sync watermarks).
//!
//! Each trait only assumes atomic single-key read-modify-write; nothing
//! relies on cross-key transactions. [`SnapshotStorage`] implements all three,
//! either purely in memory or persisted to a JSON file.

mod snapshot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;
use crate::time::now_millis;

pub use snapshot::SnapshotStorage;

/// Default retry budget for queued items.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Kind of mutation a queued item replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replay priority. Higher priorities drain first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// One entry in the durable sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    /// Routing tag: a handler tag for edge items, `store:{name}` for store items.
    pub tag: String,
    pub operation: Operation,
    /// Id of the record this item mutates, when there is one.
    #[serde(default)]
    pub record_id: Option<String>,
    pub payload: Value,
    /// Enqueue time, ms since the Unix epoch.
    pub enqueued_at: u64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub last_retry: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(tag: impl Into<String>, operation: Operation, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tag: tag.into(),
            operation,
            record_id: None,
            payload,
            enqueued_at: now_millis(),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: Priority::Normal,
            last_retry: None,
            last_error: None,
        }
    }

    pub fn record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the retry budget is spent. Exhausted items are never
    /// replayed automatically.
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Selection criteria for [`SyncQueueStore::sync_queue`].
#[derive(Debug, Clone, Default)]
pub struct QueueFilter {
    pub tag: Option<String>,
    pub record_id: Option<String>,
    pub state: QueueState,
}

/// Retry-state selector for queue listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueState {
    #[default]
    Any,
    /// `retry_count < max_retries`.
    Retryable,
    /// `retry_count >= max_retries` (dead letters).
    Exhausted,
}

impl QueueFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn record_id(mut self, id: impl Into<String>) -> Self {
        self.record_id = Some(id.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.state = QueueState::Retryable;
        self
    }

    pub fn exhausted(mut self) -> Self {
        self.state = QueueState::Exhausted;
        self
    }

    pub fn matches(&self, item: &SyncQueueItem) -> bool {
        if self.tag.as_deref().is_some_and(|t| t != item.tag) {
            return false;
        }
        if self
            .record_id
            .as_deref()
            .is_some_and(|r| item.record_id.as_deref() != Some(r))
        {
            return false;
        }
        match self.state {
            QueueState::Any => true,
            QueueState::Retryable => !item.is_exhausted(),
            QueueState::Exhausted => item.is_exhausted(),
        }
    }
}

/// Named key/value object stores.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>>;

    /// All values in `store`, ordered by key.
    async fn get_all(&self, store: &str) -> Result<Vec<Value>>;

    /// Insert or overwrite.
    async fn put(&self, store: &str, key: &str, value: Value) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, store: &str, key: &str) -> Result<bool>;

    async fn count(&self, store: &str) -> Result<usize>;

    async fn clear(&self, store: &str) -> Result<()>;
}

/// Durable FIFO queue of pending operations.
#[async_trait]
pub trait SyncQueueStore: Send + Sync {
    /// Append an item. Returns its id.
    async fn add_to_sync_queue(&self, item: SyncQueueItem) -> Result<String>;

    /// Items matching `filter`, in enqueue order.
    async fn sync_queue(&self, filter: &QueueFilter) -> Result<Vec<SyncQueueItem>>;

    async fn get_sync_item(&self, id: &str) -> Result<Option<SyncQueueItem>>;

    /// Remove an item. Returns whether it existed.
    async fn remove_sync_item(&self, id: &str) -> Result<bool>;

    /// Increment `retry_count` and stamp `last_retry`/`last_error`.
    /// Returns the updated item, or `None` if it no longer exists.
    async fn update_sync_item_retry(
        &self,
        id: &str,
        error: Option<String>,
    ) -> Result<Option<SyncQueueItem>>;

    /// Reset `retry_count` to zero. Returns whether the item existed.
    async fn reset_sync_item(&self, id: &str) -> Result<bool>;
}

/// Small key/value settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<Value>>;

    async fn set_setting(&self, key: &str, value: Value) -> Result<()>;

    async fn delete_setting(&self, key: &str) -> Result<()>;
}

/// Everything the engine needs from storage.
pub trait Storage: RecordStore + SyncQueueStore + SettingsStore {}

impl<T: RecordStore + SyncQueueStore + SettingsStore> Storage for T {}
