//! Pull/push sync protocol.
//!
//! - **Pull**: `GET {endpoint}?since={watermark}` → `{"items": [...]}`. Each
//!   item is merged; the watermark advances to the pull start time.
//! - **Push**: queued items are partitioned by operation (creates, then
//!   updates, then deletes) and sent in batches. Items within a batch are
//!   sent concurrently; a batch never holds two items for the same record,
//!   so per-record order is kept. `POST {endpoint}`, `PUT {endpoint}`,
//!   `DELETE {endpoint}/{id}`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use super::conflict::{Conflict, ConflictPolicy, Resolution, merge_fields};
use super::record::{LocalRecord, entity_id, parse_timestamp};
use super::{OfflineStore, StoreOperation, into_object};
use crate::net::{HttpRequest, HttpResponse, join_url, record_url};
use crate::storage::{Operation, QueueFilter, SyncQueueItem};
use crate::telemetry;
use crate::time::now_millis;
use crate::{HuginnError, Result};

/// Field marking a server item as deleted.
const TOMBSTONE_FIELD: &str = "deleted";

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub store: String,
    /// Offline, or another pass was already running.
    pub skipped: bool,
    /// Items received from the server.
    pub pulled: usize,
    /// Server items applied locally.
    pub merged: usize,
    pub conflicts: usize,
    pub pushed: usize,
    pub failed: usize,
    /// Items held back by open manual conflicts.
    pub held: usize,
}

#[derive(Deserialize)]
struct PullResponse {
    #[serde(default)]
    items: Vec<Value>,
}

/// Decrements the in-flight counter when a pass ends.
struct FlightGuard<'a>(&'a AtomicUsize);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl OfflineStore {
    /// Pull then push.
    ///
    /// Does nothing while offline. A call made while another pass is running
    /// is skipped unless `force` is set; the running pass then schedules a
    /// follow-up so the skipped request is not lost.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub async fn sync(&self, force: bool) -> Result<SyncReport> {
        let mut report = SyncReport {
            store: self.name().to_string(),
            ..Default::default()
        };
        if !self.inner.ctx.connectivity.is_online() {
            debug!("offline, sync skipped");
            report.skipped = true;
            return Ok(report);
        }

        let previous = self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = FlightGuard(&self.inner.in_flight);
        if previous > 0 && !force {
            debug!("sync already in flight");
            self.inner.resync.store(true, Ordering::Release);
            report.skipped = true;
            return Ok(report);
        }

        let result = async {
            self.pull(&mut report).await?;
            self.push(&mut report).await
        }
        .await;

        if self.inner.resync.swap(false, Ordering::AcqRel) {
            debug!("sync requested during pass, scheduling follow-up");
            self.schedule_sync();
        }

        match result {
            Ok(()) => {
                metrics::counter!(telemetry::STORE_SYNCS_TOTAL,
                    "store" => self.name().to_owned(),
                    "status" => "ok",
                )
                .increment(1);
                info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    failed = report.failed,
                    conflicts = report.conflicts,
                    "sync complete"
                );
                self.emit(StoreOperation::SyncComplete, serde_json::to_value(&report)?);
                Ok(report)
            }
            Err(e) => {
                metrics::counter!(telemetry::STORE_SYNCS_TOTAL,
                    "store" => self.name().to_owned(),
                    "status" => "error",
                )
                .increment(1);
                warn!(error = %e, "sync failed");
                self.emit(StoreOperation::SyncError, json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    fn endpoint_url(&self) -> String {
        join_url(&self.inner.ctx.base_url, &self.inner.config.endpoint)
    }

    async fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        Ok(match self.inner.ctx.token.token().await? {
            Some(token) => request.bearer(token),
            None => request,
        })
    }

    /// Last successful pull time, if any.
    pub async fn watermark(&self) -> Result<Option<u64>> {
        Ok(self
            .inner
            .ctx
            .storage
            .get_setting(&self.setting_key("watermark"))
            .await?
            .and_then(|v| v.as_u64()))
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let started = now_millis();
        let since = self.watermark().await?.unwrap_or(0);
        let url = format!("{}?since={since}", self.endpoint_url());
        let request = self.authorize(HttpRequest::get(url)).await?;
        let body: PullResponse = self.inner.ctx.client.send(request).await?.json()?;

        report.pulled = body.items.len();
        for item in body.items {
            self.merge_remote(item, report).await?;
        }
        self.inner
            .ctx
            .storage
            .set_setting(&self.setting_key("watermark"), json!(started))
            .await?;
        debug!(since, pulled = report.pulled, "pulled server changes");
        Ok(())
    }

    async fn merge_remote(&self, item: Value, report: &mut SyncReport) -> Result<()> {
        let config = &self.inner.config;
        let Value::Object(server) = item else {
            warn!("ignoring non-object server item");
            return Ok(());
        };
        let Some(id) = entity_id(&server, &config.id_field) else {
            warn!("ignoring server item without id");
            return Ok(());
        };
        let server_ts = server.get(&config.timestamp_field).and_then(parse_timestamp);
        let tombstone = is_tombstone(&server);

        let Some(local) = self.load(&id).await? else {
            if !tombstone {
                self.adopt_server(&id, server, server_ts, false).await?;
                report.merged += 1;
            }
            return Ok(());
        };

        if !local.is_pending() {
            self.adopt_server(&id, server, server_ts, tombstone).await?;
            report.merged += 1;
            return Ok(());
        }

        let conflicting = server_ts.is_some_and(|ts| ts > local.meta.original_timestamp);
        if !conflicting {
            debug!(id = %id, "keeping pending local changes");
            return Ok(());
        }

        report.conflicts += 1;
        metrics::counter!(telemetry::STORE_CONFLICTS_TOTAL, "store" => self.name().to_owned())
            .increment(1);
        // `conflicting` implies a server timestamp.
        let server_ts = server_ts.unwrap_or_default();
        let policy = config.conflict_policy;
        info!(id = %id, policy = policy.as_str(), "conflict detected");

        let notice = json!({
            "id": id,
            "policy": policy.as_str(),
            "local": local.entity(),
            "server": Value::Object(server.clone()),
        });

        match policy {
            ConflictPolicy::ServerWins => {
                self.emit(StoreOperation::Conflict, notice);
                self.adopt_server(&id, server, Some(server_ts), tombstone)
                    .await?;
                report.merged += 1;
            }
            ConflictPolicy::ClientWins => {
                let mut local = local;
                local.meta.original_timestamp = server_ts;
                self.save(&local).await?;
                self.emit(StoreOperation::Conflict, notice);
            }
            ConflictPolicy::Merge if tombstone => {
                self.emit(StoreOperation::Conflict, notice);
                self.adopt_server(&id, server, Some(server_ts), true).await?;
                report.merged += 1;
            }
            ConflictPolicy::Merge => {
                let mut local = local;
                local.data = merge_fields(&local.data, &server, &config.timestamp_field);
                local.meta.original_timestamp = server_ts;
                local.meta.last_modified = now_millis();
                self.save(&local).await?;
                if !local.meta.deleted {
                    self.enqueue(&local, Operation::Update).await?;
                }
                self.emit(StoreOperation::Conflict, notice);
                self.emit(StoreOperation::Merge, local.entity());
                report.merged += 1;
            }
            ConflictPolicy::Manual => {
                let conflict = Conflict {
                    id: id.clone(),
                    local: local.entity(),
                    server: Value::Object(server),
                    server_timestamp: server_ts,
                    detected_at: now_millis(),
                };
                let mut conflicts = self.load_conflicts().await?;
                conflicts.insert(id, conflict);
                self.save_conflicts(&conflicts).await?;
                self.emit(StoreOperation::Conflict, notice);
            }
        }
        Ok(())
    }

    /// Replace local state for `id` with the server version, dropping any
    /// queued local changes.
    async fn adopt_server(
        &self,
        id: &str,
        mut server: Map<String, Value>,
        server_ts: Option<u64>,
        tombstone: bool,
    ) -> Result<()> {
        let dropped = self.drop_queued(id).await?;
        if dropped > 0 {
            debug!(id, dropped, "discarded queued local changes");
        }

        if tombstone {
            if self.inner.ctx.storage.delete(self.name(), id).await? {
                self.emit(StoreOperation::RemoteDelete, json!({ "id": id }));
            }
            return Ok(());
        }

        server.insert(
            self.inner.config.id_field.clone(),
            Value::String(id.to_string()),
        );
        let record = LocalRecord::synced(id.to_string(), server, server_ts.unwrap_or_else(now_millis));
        self.save(&record).await?;
        self.emit(StoreOperation::Merge, record.entity());
        Ok(())
    }

    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        let held_ids = self.load_conflicts().await?;
        let items = self
            .inner
            .ctx
            .storage
            .sync_queue(&QueueFilter::new().tag(self.queue_tag()).retryable())
            .await?;
        let (held, items): (Vec<_>, Vec<_>) = items.into_iter().partition(|item| {
            item.record_id
                .as_ref()
                .is_some_and(|id| held_ids.contains_key(id))
        });
        report.held = held.len();

        let batch_size = self.inner.config.batch_size.max(1);
        for operation in [Operation::Create, Operation::Update, Operation::Delete] {
            let partition: Vec<SyncQueueItem> = items
                .iter()
                .filter(|item| item.operation == operation)
                .cloned()
                .collect();
            for batch in batches(partition, batch_size) {
                let results = join_all(batch.iter().map(|item| self.push_item(item))).await;
                for (item, result) in batch.iter().zip(results) {
                    let status = if result.is_ok() { "ok" } else { "error" };
                    metrics::counter!(telemetry::STORE_PUSHED_TOTAL,
                        "store" => self.name().to_owned(),
                        "operation" => operation.as_str(),
                        "status" => status,
                    )
                    .increment(1);
                    match result {
                        Ok(()) => report.pushed += 1,
                        Err(e) => {
                            report.failed += 1;
                            let updated = self
                                .inner
                                .ctx
                                .storage
                                .update_sync_item_retry(&item.id, Some(e.to_string()))
                                .await?;
                            warn!(
                                id = %item.id,
                                record_id = item.record_id.as_deref().unwrap_or_default(),
                                %operation,
                                retry_count = updated.map_or(item.retry_count + 1, |u| u.retry_count),
                                error = %e,
                                "push failed"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn push_item(&self, item: &SyncQueueItem) -> Result<()> {
        let id = item.record_id.as_deref().ok_or_else(|| {
            HuginnError::InvalidInput(format!("queued item {} has no record id", item.id))
        })?;
        let request = match item.operation {
            Operation::Create => HttpRequest::post(self.endpoint_url()).json(&item.payload)?,
            Operation::Update => HttpRequest::put(self.endpoint_url()).json(&item.payload)?,
            Operation::Delete => HttpRequest::delete(record_url(&self.endpoint_url(), id)?),
        };
        let request = self.authorize(request).await?;

        let response = match self.inner.ctx.client.send(request).await {
            Ok(response) => Some(response),
            Err(HuginnError::Server { status: 404, .. }) if item.operation == Operation::Delete => {
                None
            }
            Err(e) => return Err(e),
        };

        self.inner.ctx.storage.remove_sync_item(&item.id).await?;
        self.reconcile(id, item.operation, response).await
    }

    /// Apply a confirmed push to the local record.
    async fn reconcile(
        &self,
        id: &str,
        operation: Operation,
        response: Option<HttpResponse>,
    ) -> Result<()> {
        if operation == Operation::Delete {
            self.drop_queued(id).await?;
            self.inner.ctx.storage.delete(self.name(), id).await?;
            return Ok(());
        }

        let Some(mut record) = self.load(id).await? else {
            return Ok(());
        };
        // Newer local changes are still queued; keep them and stay pending.
        if record.meta.deleted || !self.queued(Some(id)).await?.is_empty() {
            return Ok(());
        }

        let config = &self.inner.config;
        // Adopt the server's copy when the response echoes the entity.
        if let Some(Value::Object(mut server)) = response.and_then(|r| r.json::<Value>().ok()) {
            if server.contains_key(&config.id_field) {
                server.insert(config.id_field.clone(), Value::String(id.to_string()));
                record.data = server;
            }
        }
        if let Some(ts) = record.data.get(&config.timestamp_field).and_then(parse_timestamp) {
            record.meta.original_timestamp = ts;
        }
        record.mark_synced();
        self.save(&record).await
    }

    /// Open manual conflicts, ordered by record id.
    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.load_conflicts().await?.into_values().collect())
    }

    /// Settle a parked conflict and release the record's queued changes.
    #[instrument(skip(self, resolution), fields(store = %self.name()))]
    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<()> {
        let mut conflicts = self.load_conflicts().await?;
        let conflict = conflicts
            .remove(id)
            .ok_or_else(|| HuginnError::not_found(self.name(), id))?;
        let config = &self.inner.config;

        let label = match resolution {
            Resolution::KeepLocal => {
                if let Some(mut local) = self.load(id).await? {
                    local.meta.original_timestamp = conflict.server_timestamp;
                    self.save(&local).await?;
                }
                "keep-local"
            }
            Resolution::TakeServer => {
                let server = into_object(conflict.server)?;
                let tombstone = is_tombstone(&server);
                self.adopt_server(id, server, Some(conflict.server_timestamp), tombstone)
                    .await?;
                "take-server"
            }
            Resolution::Merged(value) => {
                let mut data = into_object(value)?;
                let now = now_millis();
                data.insert(config.id_field.clone(), Value::String(id.to_string()));
                data.insert(config.timestamp_field.clone(), now.into());
                let mut record = LocalRecord::pending(id.to_string(), data, Operation::Update, now);
                record.meta.original_timestamp = conflict.server_timestamp;
                self.drop_queued(id).await?;
                self.save(&record).await?;
                self.enqueue(&record, Operation::Update).await?;
                "merged"
            }
        };

        self.save_conflicts(&conflicts).await?;
        info!(id, resolution = label, "conflict resolved");
        let current = self.get(id).await?.unwrap_or(Value::Null);
        self.emit(
            StoreOperation::ConflictResolved,
            json!({ "id": id, "resolution": label, "record": current }),
        );
        self.schedule_sync();
        Ok(())
    }

    pub(crate) async fn load_conflicts(&self) -> Result<BTreeMap<String, Conflict>> {
        match self
            .inner
            .ctx
            .storage
            .get_setting(&self.setting_key("conflicts"))
            .await?
        {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BTreeMap::new()),
        }
    }

    pub(crate) async fn save_conflicts(&self, conflicts: &BTreeMap<String, Conflict>) -> Result<()> {
        let key = self.setting_key("conflicts");
        let storage = &self.inner.ctx.storage;
        if conflicts.is_empty() {
            storage.delete_setting(&key).await
        } else {
            storage.set_setting(&key, serde_json::to_value(conflicts)?).await
        }
    }
}

fn is_tombstone(item: &Map<String, Value>) -> bool {
    item.get(TOMBSTONE_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Split `items` into batches of at most `size`, never placing two items
/// for the same record in one batch. Relative order is preserved.
fn batches(items: Vec<SyncQueueItem>, size: usize) -> Vec<Vec<SyncQueueItem>> {
    let mut out = Vec::new();
    let mut remaining = items;
    while !remaining.is_empty() {
        let mut batch = Vec::new();
        let mut seen = HashSet::new();
        let mut deferred = Vec::new();
        for item in remaining {
            let key = item.record_id.clone().unwrap_or_else(|| item.id.clone());
            if batch.len() < size && seen.insert(key.clone()) {
                batch.push(item);
            } else {
                seen.insert(key);
                deferred.push(item);
            }
        }
        out.push(batch);
        remaining = deferred;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(record: &str) -> SyncQueueItem {
        SyncQueueItem::new("t", Operation::Update, Value::Null).record_id(record)
    }

    fn records(batch: &[SyncQueueItem]) -> Vec<&str> {
        batch.iter().filter_map(|i| i.record_id.as_deref()).collect()
    }

    #[test]
    fn batches_respect_size() {
        let items = (0..5).map(|n| item(&n.to_string())).collect();
        let out = batches(items, 2);
        assert_eq!(out.len(), 3);
        assert_eq!(records(&out[0]), vec!["0", "1"]);
        assert_eq!(records(&out[2]), vec!["4"]);
    }

    #[test]
    fn same_record_never_shares_a_batch() {
        let items = vec![item("a"), item("a"), item("b"), item("a")];
        let out = batches(items, 10);
        assert_eq!(records(&out[0]), vec!["a", "b"]);
        assert_eq!(records(&out[1]), vec!["a"]);
        assert_eq!(records(&out[2]), vec!["a"]);
    }
}
