//! Ownership of a set of named stores sharing one [`StoreContext`].
//!
//! Fan-out operations run against every store concurrently and report each
//! store's outcome separately: one store failing never hides the others.

use std::collections::BTreeMap;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{OfflineStore, StoreConfig, StoreContext, StoreExport, StoreStats, SyncReport};
use crate::{HuginnError, Result};

pub struct StoreManager {
    ctx: StoreContext,
    stores: BTreeMap<String, OfflineStore>,
}

impl StoreManager {
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            ctx,
            stores: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Create a store. Names must be unique.
    pub fn open(&mut self, config: StoreConfig) -> Result<OfflineStore> {
        if self.stores.contains_key(&config.name) {
            return Err(HuginnError::Configuration(format!(
                "store '{}' is already open",
                config.name
            )));
        }
        let store = OfflineStore::new(config, self.ctx.clone());
        info!(store = %store.name(), endpoint = %store.config().endpoint, "store opened");
        self.stores.insert(store.name().to_string(), store.clone());
        Ok(store)
    }

    pub fn store(&self, name: &str) -> Result<OfflineStore> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| HuginnError::UnknownStore(name.to_string()))
    }

    /// Store names in order.
    pub fn names(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }

    pub async fn sync_all(&self, force: bool) -> Vec<(String, Result<SyncReport>)> {
        let results = join_all(self.stores.values().map(|s| s.sync(force))).await;
        let results = self.label(results);
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "some stores failed to sync");
        }
        results
    }

    pub async fn export_all(&self) -> Vec<(String, Result<StoreExport>)> {
        let results = join_all(self.stores.values().map(|s| s.export())).await;
        self.label(results)
    }

    /// Import each export into the store of the same name.
    pub async fn import_all(&self, exports: Vec<StoreExport>) -> Vec<(String, Result<usize>)> {
        let imports = exports.into_iter().map(|export| async move {
            let name = export.store.clone();
            let result = match self.store(&name) {
                Ok(store) => store.import(export).await,
                Err(e) => Err(e),
            };
            (name, result)
        });
        join_all(imports).await
    }

    pub async fn clear_all(&self) -> Vec<(String, Result<()>)> {
        let results = join_all(self.stores.values().map(|s| s.clear())).await;
        self.label(results)
    }

    pub async fn all_stats(&self) -> Vec<(String, Result<StoreStats>)> {
        let results = join_all(self.stores.values().map(|s| s.stats())).await;
        self.label(results)
    }

    /// One online listener per store.
    pub fn spawn_online_listeners(&self) -> Vec<JoinHandle<()>> {
        self.stores
            .values()
            .map(OfflineStore::spawn_online_listener)
            .collect()
    }

    fn label<T>(&self, results: Vec<T>) -> Vec<(String, T)> {
        self.stores.keys().cloned().zip(results).collect()
    }
}
