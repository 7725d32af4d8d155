//! Snapshot-based storage: in memory, optionally mirrored to a JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{QueueFilter, RecordStore, SettingsStore, SyncQueueItem, SyncQueueStore};
use crate::time::now_millis;
use crate::{HuginnError, Result};

/// Maximum supported snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    queue: Vec<SyncQueueItem>,
    #[serde(default)]
    settings: BTreeMap<String, Value>,
}

/// [`Storage`](super::Storage) implementation holding all state in one
/// in-memory snapshot.
///
/// When opened with a path, every mutation rewrites the snapshot file
/// atomically (write to `*.tmp`, then rename), so a crash leaves either the
/// previous or the new state on disk.
pub struct SnapshotStorage {
    state: Mutex<Snapshot>,
    path: Option<PathBuf>,
}

impl SnapshotStorage {
    /// Volatile storage, for tests and ephemeral sessions.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(Snapshot {
                version: SNAPSHOT_VERSION,
                ..Default::default()
            }),
            path: None,
        }
    }

    /// Open (or create) file-backed storage at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let snapshot: Snapshot = serde_json::from_str(&content).map_err(|e| {
                    HuginnError::Storage(format!("corrupt snapshot {}: {e}", path.display()))
                })?;
                if snapshot.version > SNAPSHOT_VERSION {
                    return Err(HuginnError::Storage(format!(
                        "unsupported snapshot version {} (max supported: {SNAPSHOT_VERSION})",
                        snapshot.version
                    )));
                }
                debug!(path = %path.display(), queued = snapshot.queue.len(), "loaded storage snapshot");
                snapshot
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot {
                version: SNAPSHOT_VERSION,
                ..Default::default()
            },
            Err(e) => {
                return Err(HuginnError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            state: Mutex::new(snapshot),
            path: Some(path),
        })
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> Result<T> {
        let state = self
            .state
            .lock()
            .map_err(|e| HuginnError::Storage(format!("lock poisoned: {e}")))?;
        Ok(f(&state))
    }

    /// Apply a mutation and persist. The file is written while the lock is
    /// held so concurrent writers cannot reorder snapshots on disk.
    fn write<T>(&self, f: impl FnOnce(&mut Snapshot) -> T) -> Result<T> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| HuginnError::Storage(format!("lock poisoned: {e}")))?;
        let out = f(&mut state);
        if let Some(path) = &self.path {
            persist(path, &state)?;
        }
        Ok(out)
    }
}

fn persist(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                HuginnError::Storage(format!(
                    "failed to create storage dir {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }

    let json = serde_json::to_vec(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json).map_err(|e| {
        warn!(path = %tmp_path.display(), error = %e, "snapshot write failed");
        HuginnError::Storage(format!("failed to write {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        HuginnError::Storage(format!(
            "failed to rename {} → {}: {e}",
            tmp_path.display(),
            path.display()
        ))
    })
}

#[async_trait]
impl RecordStore for SnapshotStorage {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        self.read(|s| s.records.get(store).and_then(|r| r.get(key)).cloned())
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        self.read(|s| {
            s.records
                .get(store)
                .map(|r| r.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn put(&self, store: &str, key: &str, value: Value) -> Result<()> {
        self.write(|s| {
            s.records
                .entry(store.to_string())
                .or_default()
                .insert(key.to_string(), value);
        })
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        self.write(|s| {
            s.records
                .get_mut(store)
                .is_some_and(|r| r.remove(key).is_some())
        })
    }

    async fn count(&self, store: &str) -> Result<usize> {
        self.read(|s| s.records.get(store).map_or(0, BTreeMap::len))
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.write(|s| {
            s.records.remove(store);
        })
    }
}

#[async_trait]
impl SyncQueueStore for SnapshotStorage {
    async fn add_to_sync_queue(&self, item: SyncQueueItem) -> Result<String> {
        let id = item.id.clone();
        self.write(|s| s.queue.push(item))?;
        Ok(id)
    }

    async fn sync_queue(&self, filter: &QueueFilter) -> Result<Vec<SyncQueueItem>> {
        self.read(|s| {
            s.queue
                .iter()
                .filter(|item| filter.matches(item))
                .cloned()
                .collect()
        })
    }

    async fn get_sync_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        self.read(|s| s.queue.iter().find(|i| i.id == id).cloned())
    }

    async fn remove_sync_item(&self, id: &str) -> Result<bool> {
        self.write(|s| {
            let before = s.queue.len();
            s.queue.retain(|i| i.id != id);
            s.queue.len() != before
        })
    }

    async fn update_sync_item_retry(
        &self,
        id: &str,
        error: Option<String>,
    ) -> Result<Option<SyncQueueItem>> {
        self.write(|s| {
            s.queue.iter_mut().find(|i| i.id == id).map(|item| {
                item.retry_count += 1;
                item.last_retry = Some(now_millis());
                item.last_error = error;
                item.clone()
            })
        })
    }

    async fn reset_sync_item(&self, id: &str) -> Result<bool> {
        self.write(|s| match s.queue.iter_mut().find(|i| i.id == id) {
            Some(item) => {
                item.retry_count = 0;
                item.last_error = None;
                true
            }
            None => false,
        })
    }
}

#[async_trait]
impl SettingsStore for SnapshotStorage {
    async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        self.read(|s| s.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        self.write(|s| {
            s.settings.insert(key.to_string(), value);
        })
    }

    async fn delete_setting(&self, key: &str) -> Result<()> {
        self.write(|s| {
            s.settings.remove(key);
        })
    }
}
