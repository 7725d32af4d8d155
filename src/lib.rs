//! Huginn - offline-first edge cache and local-first sync engine
//!
//! Two cooperating layers keep an application usable without a network:
//!
//! - [`EdgeCache`] intercepts outgoing HTTP requests, serves them from named
//!   cache buckets under per-bucket strategies, falls back to cached or
//!   synthesized responses when offline, and parks failed mutations in a
//!   durable [`SyncQueueManager`] for replay.
//! - [`OfflineStore`] keeps entity collections locally, applies every write
//!   immediately, and reconciles with the server through pull/push sync with
//!   configurable conflict policies. A [`StoreManager`] owns several stores.
//!
//! Both share a [`Storage`](storage::Storage) backend and a [`Connectivity`]
//! signal the host flips when the network comes and goes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use huginn::{Connectivity, StoreManager};
//! use huginn::net::ReqwestClient;
//! use huginn::storage::SnapshotStorage;
//! use huginn::store::{ConflictPolicy, StoreConfig, StoreContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let storage = Arc::new(SnapshotStorage::open("huginn.json")?);
//!     let client = Arc::new(ReqwestClient::new()?);
//!     let ctx = StoreContext::new(storage, client, "https://console.example.org")
//!         .with_connectivity(Connectivity::online());
//!
//!     let mut stores = StoreManager::new(ctx);
//!     let evaluations = stores.open(
//!         StoreConfig::new("evaluations", "/api/evaluations")
//!             .conflict_policy(ConflictPolicy::Merge),
//!     )?;
//!
//!     let created = evaluations.create(json!({"title": "Baseline survey"})).await?;
//!     println!("created {}", created["id"]);
//!
//!     let report = evaluations.sync(true).await?;
//!     println!("pushed {} change(s)", report.pushed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connectivity;
pub mod edge;
pub mod error;
pub mod net;
pub mod storage;
pub mod store;
pub mod telemetry;
mod time;
pub mod version;

pub use config::{Config, RemoteConfig, Secrets};
pub use connectivity::{Connectivity, ConnectivityWatch, ReplayRegistrar};
pub use edge::{EdgeCache, EdgeConfig, EdgeRequest, EdgeResponse, SyncQueueManager};
pub use error::{HuginnError, Result};
pub use net::{HttpClient, HttpRequest, HttpResponse, RetryConfig};
pub use storage::{Operation, Priority, SnapshotStorage, SyncQueueItem};
pub use store::{OfflineStore, StoreConfig, StoreManager};
pub use version::{PKG_VERSION, version_info, version_string};
