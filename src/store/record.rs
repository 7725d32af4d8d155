//! Local record model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::storage::Operation;

/// Whether a record carries unconfirmed local changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
}

/// Sync bookkeeping kept alongside a record. Never returned by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    /// Time of the last local or merged change (ms).
    pub last_modified: u64,
    pub sync_status: SyncStatus,
    /// Last local mutation, while pending.
    #[serde(default)]
    pub operation: Option<Operation>,
    /// Server timestamp our pending changes are based on (ms). A server
    /// version newer than this conflicts with pending local changes.
    pub original_timestamp: u64,
    /// Soft-deleted, awaiting delete confirmation.
    #[serde(default)]
    pub deleted: bool,
}

/// An entity held in a local-first store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: String,
    /// Entity fields, including the id field.
    pub data: Map<String, Value>,
    pub meta: RecordMeta,
}

impl LocalRecord {
    /// A record with a local, not yet pushed mutation.
    pub fn pending(id: String, data: Map<String, Value>, operation: Operation, now: u64) -> Self {
        Self {
            id,
            data,
            meta: RecordMeta {
                last_modified: now,
                sync_status: SyncStatus::Pending,
                operation: Some(operation),
                original_timestamp: now,
                deleted: false,
            },
        }
    }

    /// A record adopted from the server as of `timestamp`.
    pub fn synced(id: String, data: Map<String, Value>, timestamp: u64) -> Self {
        Self {
            id,
            data,
            meta: RecordMeta {
                last_modified: timestamp,
                sync_status: SyncStatus::Synced,
                operation: None,
                original_timestamp: timestamp,
                deleted: false,
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.meta.sync_status == SyncStatus::Pending
    }

    /// The entity as callers see it.
    pub fn entity(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Case-insensitive substring match over string-valued fields.
    /// `needle` must already be lowercase.
    pub(crate) fn matches(&self, needle: &str) -> bool {
        self.data
            .values()
            .any(|v| v.as_str().is_some_and(|s| s.to_lowercase().contains(needle)))
    }

    pub(crate) fn mark_synced(&mut self) {
        self.meta.sync_status = SyncStatus::Synced;
        self.meta.operation = None;
    }
}

/// Read an entity timestamp: epoch milliseconds as a number or numeric
/// string, or an RFC 3339 date.
pub fn parse_timestamp(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.parse::<u64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .and_then(|d| u64::try_from(d.timestamp_millis()).ok())
        }),
        _ => None,
    }
}

/// Id of an entity: a string or numeric `field`.
pub(crate) fn entity_id(data: &Map<String, Value>, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
