//! Conflict policies and resolution.
//!
//! A conflict exists when a local record has pending changes and the server
//! sends a version stamped later than the record's `original_timestamp`.
//!
//! | Policy | Effect |
//! |--------|--------|
//! | `server-wins` | adopt the server version, drop queued local changes |
//! | `client-wins` | keep local data, rebase it on the server timestamp |
//! | `merge` | field union (local on top), newest timestamp wins, re-push |
//! | `manual` | park both versions until [`resolve_conflict`](super::OfflineStore::resolve_conflict) |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::record::parse_timestamp;

/// How a store resolves conflicting server changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    #[default]
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::ServerWins => "server-wins",
            ConflictPolicy::ClientWins => "client-wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Manual => "manual",
        }
    }
}

/// An open conflict awaiting an application decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub local: Value,
    pub server: Value,
    /// Timestamp of the server version (ms).
    pub server_timestamp: u64,
    pub detected_at: u64,
}

/// Application decision for a parked conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local version and push it.
    KeepLocal,
    /// Adopt the server version, discarding local changes.
    TakeServer,
    /// Replace the record with this value and push it.
    Merged(Value),
}

/// Field union of `server` and `local`, local fields on top. The timestamp
/// field takes the newer of the two values.
pub fn merge_fields(
    local: &Map<String, Value>,
    server: &Map<String, Value>,
    timestamp_field: &str,
) -> Map<String, Value> {
    let mut merged = server.clone();
    for (k, v) in local {
        merged.insert(k.clone(), v.clone());
    }

    let local_ts = local.get(timestamp_field).map(|v| (parse_timestamp(v), v));
    let server_ts = server.get(timestamp_field).map(|v| (parse_timestamp(v), v));
    let newest = match (local_ts, server_ts) {
        (Some((l, lv)), Some((s, sv))) => Some(if s > l { sv } else { lv }),
        (Some((_, v)), None) | (None, Some((_, v))) => Some(v),
        (None, None) => None,
    };
    if let Some(v) = newest {
        merged.insert(timestamp_field.to_string(), v.clone());
    }
    merged
}
