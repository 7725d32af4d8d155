//! Store maintenance: export, import, clear, and statistics.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::{LocalRecord, OfflineStore, StoreOperation};
use crate::storage::SyncQueueItem;
use crate::time::now_millis;
use crate::{HuginnError, Result};

/// Portable dump of one store: records with bookkeeping, queued mutations,
/// and the pull watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreExport {
    pub store: String,
    pub exported_at: u64,
    pub records: Vec<LocalRecord>,
    #[serde(default)]
    pub queue: Vec<SyncQueueItem>,
    #[serde(default)]
    pub watermark: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub name: String,
    /// Records held locally, deleted ones included.
    pub total: usize,
    pub pending: usize,
    /// Soft-deleted records awaiting push.
    pub deleted: usize,
    /// Retryable queued mutations.
    pub queued: usize,
    pub dead_letters: usize,
    pub conflicts: usize,
    pub watermark: Option<u64>,
    pub syncing: bool,
    pub online: bool,
    /// Registered change callbacks.
    pub subscribers: usize,
}

impl OfflineStore {
    pub async fn export(&self) -> Result<StoreExport> {
        Ok(StoreExport {
            store: self.name().to_string(),
            exported_at: now_millis(),
            records: self.load_all().await?,
            queue: self.queued(None).await?,
            watermark: self.watermark().await?,
        })
    }

    /// Load an export of this store. Records are upserted; queue items
    /// already present are kept as they are. Returns the number of records
    /// written.
    pub async fn import(&self, export: StoreExport) -> Result<usize> {
        if export.store != self.name() {
            return Err(HuginnError::InvalidInput(format!(
                "export of store '{}' cannot be imported into '{}'",
                export.store,
                self.name()
            )));
        }
        let storage = &self.inner.ctx.storage;

        for record in &export.records {
            self.save(record).await?;
        }
        let mut queued = 0;
        for item in export.queue {
            if storage.get_sync_item(&item.id).await?.is_none() {
                storage.add_to_sync_queue(item).await?;
                queued += 1;
            }
        }
        if let Some(imported) = export.watermark {
            let current = self.watermark().await?.unwrap_or(0);
            storage
                .set_setting(&self.setting_key("watermark"), json!(imported.max(current)))
                .await?;
        }

        let count = export.records.len();
        info!(store = %self.name(), records = count, queued, "store imported");
        self.emit(
            StoreOperation::Import,
            json!({ "records": count, "queued": queued }),
        );
        Ok(count)
    }

    /// Drop all local state: records, queued mutations, the watermark, and
    /// open conflicts.
    pub async fn clear(&self) -> Result<()> {
        let storage = &self.inner.ctx.storage;
        storage.clear(self.name()).await?;
        for item in self.queued(None).await? {
            storage.remove_sync_item(&item.id).await?;
        }
        storage.delete_setting(&self.setting_key("watermark")).await?;
        storage.delete_setting(&self.setting_key("conflicts")).await?;
        info!(store = %self.name(), "store cleared");
        self.emit(StoreOperation::Clear, json!({}));
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let records = self.load_all().await?;
        let queue = self.queued(None).await?;
        let dead_letters = queue.iter().filter(|i| i.is_exhausted()).count();
        Ok(StoreStats {
            name: self.name().to_string(),
            total: records.len(),
            pending: records.iter().filter(|r| r.is_pending()).count(),
            deleted: records.iter().filter(|r| r.meta.deleted).count(),
            queued: queue.len() - dead_letters,
            dead_letters,
            conflicts: self.load_conflicts().await?.len(),
            watermark: self.watermark().await?,
            syncing: self.is_syncing(),
            online: self.inner.ctx.connectivity.is_online(),
            subscribers: self.inner.subscribers.len(),
        })
    }

    /// Whether a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.inner
            .in_flight
            .load(std::sync::atomic::Ordering::Acquire)
            > 0
    }
}
