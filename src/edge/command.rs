//! Command messaging boundary.
//!
//! Hosts talk to a running edge cache through typed [`Command`]s. On the wire
//! a command is `{"type": "GET_CACHE_STATS", "payload": {...}}`; the reply is
//! a JSON value. [`EdgeCache::spawn_command_loop`] serves commands from an
//! mpsc channel, answering each through a oneshot sender.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{EdgeCache, EnqueueOptions};
use crate::storage::{Operation, Priority};
use crate::{HuginnError, Result};

const COMMAND_BUFFER: usize = 32;

/// A request to a running edge cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    GetVersion,
    GetCacheStats,
    GetPerformanceMetrics,
    WarmUrls {
        urls: Vec<String>,
    },
    /// Clear one bucket, or all buckets when `bucket` is absent.
    ClearCache {
        #[serde(default)]
        bucket: Option<String>,
    },
    QueueSync {
        tag: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        operation: Option<Operation>,
        #[serde(default)]
        record_id: Option<String>,
        #[serde(default)]
        priority: Option<Priority>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetVersion => "GET_VERSION",
            Command::GetCacheStats => "GET_CACHE_STATS",
            Command::GetPerformanceMetrics => "GET_PERFORMANCE_METRICS",
            Command::WarmUrls { .. } => "WARM_URLS",
            Command::ClearCache { .. } => "CLEAR_CACHE",
            Command::QueueSync { .. } => "QUEUE_SYNC",
        }
    }
}

type Envelope = (Command, oneshot::Sender<Result<Value>>);

/// Sending side of a command loop. Cheap to clone.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<Envelope>,
}

impl CommandHandle {
    /// Send a command and wait for its reply.
    pub async fn send(&self, command: Command) -> Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((command, reply_tx))
            .await
            .map_err(|_| HuginnError::Stopped)?;
        reply_rx.await.map_err(|_| HuginnError::Stopped)?
    }
}

impl EdgeCache {
    /// Execute one command.
    pub async fn handle_command(&self, command: Command) -> Result<Value> {
        debug!(command = command.name(), "handling command");
        match command {
            Command::GetVersion => Ok(serde_json::to_value(crate::version::version_info())?),
            Command::GetCacheStats => Ok(serde_json::to_value(self.stats().await?)?),
            Command::GetPerformanceMetrics => {
                let perf = self.performance();
                let counters: serde_json::Map<String, Value> = self
                    .config()
                    .buckets
                    .keys()
                    .map(|name| (name.clone(), json!(perf.counters(name))))
                    .collect();
                Ok(json!({
                    "metrics": perf.summary(),
                    "buckets": counters,
                }))
            }
            Command::WarmUrls { urls } => Ok(serde_json::to_value(self.warm(&urls).await)?),
            Command::ClearCache { bucket } => {
                match &bucket {
                    Some(name) => self.clear_bucket(name).await?,
                    None => self.clear_all().await?,
                }
                Ok(json!({ "cleared": bucket.unwrap_or_else(|| "all".to_string()) }))
            }
            Command::QueueSync {
                tag,
                payload,
                operation,
                record_id,
                priority,
            } => {
                let queue = self.queue().ok_or_else(|| {
                    HuginnError::Configuration("edge cache has no sync queue".to_string())
                })?;
                let mut options = EnqueueOptions::new()
                    .operation(operation.unwrap_or(Operation::Create))
                    .priority(priority.unwrap_or_default());
                if let Some(id) = record_id {
                    options = options.record_id(id);
                }
                let id = queue.enqueue(&tag, payload, options).await?;
                Ok(json!({ "queued": true, "id": id, "tag": tag }))
            }
        }
    }

    /// Serve commands on a background task until every handle is dropped.
    pub fn spawn_command_loop(&self) -> (CommandHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Envelope>(COMMAND_BUFFER);
        let cache = self.clone();
        let task = tokio::spawn(async move {
            while let Some((command, reply)) = rx.recv().await {
                let result = cache.handle_command(command).await;
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            debug!("command loop stopped");
        });
        (CommandHandle { tx }, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_type_and_payload() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "WARM_URLS",
            "payload": { "urls": ["/a.js"] }
        }))
        .unwrap();
        assert_eq!(
            cmd,
            Command::WarmUrls {
                urls: vec!["/a.js".to_string()]
            }
        );

        let unit: Command = serde_json::from_value(json!({ "type": "GET_VERSION" })).unwrap();
        assert_eq!(unit, Command::GetVersion);
        assert_eq!(
            serde_json::to_value(&Command::GetCacheStats).unwrap()["type"],
            "GET_CACHE_STATS"
        );
    }

    #[test]
    fn queue_sync_defaults() {
        let cmd: Command = serde_json::from_value(json!({
            "type": "QUEUE_SYNC",
            "payload": { "tag": "analytics-sync" }
        }))
        .unwrap();
        let Command::QueueSync {
            payload, operation, ..
        } = cmd
        else {
            panic!("expected QueueSync");
        };
        assert_eq!(payload, Value::Null);
        assert_eq!(operation, None);
    }
}
