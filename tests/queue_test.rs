//! Sync queue manager: enqueue, drain, retries, and dead letters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use huginn::edge::{EnqueueOptions, QueueConfig, SyncHandler, SyncQueueManager};
use huginn::net::{ReqwestClient, StaticToken};
use huginn::storage::{Operation, Priority, SyncQueueItem};
use huginn::{Connectivity, HuginnError, ReplayRegistrar, Result, SnapshotStorage};

/// Records replayed items; fails the first `failures` calls.
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<Vec<SyncQueueItem>>,
    failures: AtomicU32,
}

impl RecordingHandler {
    fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            ..Default::default()
        }
    }

    fn seen(&self) -> Vec<SyncQueueItem> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SyncHandler for RecordingHandler {
    async fn replay(&self, item: &SyncQueueItem) -> Result<()> {
        self.seen.lock().unwrap().push(item.clone());
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(HuginnError::Network("unreachable".into()));
        }
        Ok(())
    }
}

/// Takes `delay` per replayed item.
struct SlowHandler {
    delay: Duration,
}

#[async_trait]
impl SyncHandler for SlowHandler {
    async fn replay(&self, _item: &SyncQueueItem) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Records registered tags, optionally refusing every registration.
#[derive(Default)]
struct RecordingRegistrar {
    tags: Mutex<Vec<String>>,
    refuse: bool,
}

#[async_trait]
impl ReplayRegistrar for RecordingRegistrar {
    async fn register(&self, tag: &str) -> Result<()> {
        self.tags.lock().unwrap().push(tag.to_string());
        if self.refuse {
            return Err(HuginnError::Configuration("background sync unsupported".into()));
        }
        Ok(())
    }
}

fn manager() -> SyncQueueManager {
    SyncQueueManager::new(Arc::new(SnapshotStorage::in_memory()))
}

#[tokio::test]
async fn drain_replays_and_removes_items() {
    let queue = manager();
    let handler = Arc::new(RecordingHandler::default());
    queue.register_handler("evaluation-sync", handler.clone());

    queue
        .enqueue("evaluation-sync", json!({"a": 1}), EnqueueOptions::new())
        .await
        .unwrap();
    queue
        .enqueue(
            "evaluation-sync",
            json!({"a": 2}),
            EnqueueOptions::new()
                .operation(Operation::Update)
                .record_id("9"),
        )
        .await
        .unwrap();

    let report = queue.drain("evaluation-sync").await.unwrap();
    assert_eq!((report.attempted, report.succeeded, report.failed), (2, 2, 0));
    assert!(queue.pending(None).await.unwrap().is_empty());

    let seen = handler.seen();
    assert_eq!(seen[0].payload, json!({"a": 1}));
    assert_eq!(seen[1].record_id.as_deref(), Some("9"));
}

#[tokio::test]
async fn drain_orders_by_priority_then_enqueue_order() {
    let queue = manager();
    let handler = Arc::new(RecordingHandler::default());
    queue.register_handler("t", handler.clone());

    for (n, priority) in [
        (1, Priority::Low),
        (2, Priority::Normal),
        (3, Priority::High),
        (4, Priority::Normal),
    ] {
        queue
            .enqueue("t", json!(n), EnqueueOptions::new().priority(priority))
            .await
            .unwrap();
    }
    queue.drain("t").await.unwrap();

    let order: Vec<_> = handler.seen().iter().map(|i| i.payload.clone()).collect();
    assert_eq!(order, vec![json!(3), json!(2), json!(4), json!(1)]);
}

#[tokio::test]
async fn unknown_tag_fails_without_touching_items() {
    let queue = manager();
    queue
        .enqueue("orphan", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    assert!(matches!(
        queue.drain("orphan").await,
        Err(HuginnError::UnknownTag(tag)) if tag == "orphan"
    ));
    let pending = queue.pending(Some("orphan")).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test]
async fn failures_exhaust_into_dead_letters() {
    let queue = manager();
    queue.register_handler("t", Arc::new(RecordingHandler::failing(u32::MAX)));
    let id = queue
        .enqueue("t", json!({}), EnqueueOptions::new().max_retries(2))
        .await
        .unwrap();

    let first = queue.drain("t").await.unwrap();
    assert_eq!((first.failed, first.exhausted), (1, 0));
    let second = queue.drain("t").await.unwrap();
    assert_eq!((second.failed, second.exhausted), (1, 1));

    // Exhausted items are no longer replayed.
    let third = queue.drain("t").await.unwrap();
    assert_eq!(third.attempted, 0);

    let dead = queue.dead_letters(Some("t")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, id);
    assert_eq!(dead[0].retry_count, 2);
    assert!(dead[0].last_error.as_deref().unwrap().contains("unreachable"));
}

#[tokio::test]
async fn requeue_and_purge_dead_letters() {
    let queue = manager();
    let handler = Arc::new(RecordingHandler::failing(1));
    queue.register_handler("t", handler.clone());
    let id = queue
        .enqueue("t", json!({}), EnqueueOptions::new().max_retries(1))
        .await
        .unwrap();

    queue.drain("t").await.unwrap();
    assert_eq!(queue.dead_letters(None).await.unwrap().len(), 1);

    assert!(queue.requeue(&id).await.unwrap());
    let report = queue.drain("t").await.unwrap();
    assert_eq!(report.succeeded, 1);

    let other = queue
        .enqueue("t", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    assert!(queue.purge(&other).await.unwrap());
    assert!(!queue.purge(&other).await.unwrap());
    assert!(queue.pending(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn default_retry_budget_comes_from_config() {
    let queue = SyncQueueManager::with_config(
        Arc::new(SnapshotStorage::in_memory()),
        QueueConfig {
            default_max_retries: 7,
            drain_interval: None,
        },
    );
    queue
        .enqueue("t", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(queue.pending(None).await.unwrap()[0].max_retries, 7);
}

#[tokio::test]
async fn reconnect_triggers_replay() {
    let queue = manager();
    let handler = Arc::new(RecordingHandler::default());
    queue.register_handler("t", handler.clone());
    queue
        .enqueue("t", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let connectivity = Connectivity::offline();
    let task = queue.spawn_replay_on_reconnect(&connectivity);
    tokio::task::yield_now().await;
    connectivity.set_online(true);

    for _ in 0..100 {
        if queue.pending(None).await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(queue.pending(None).await.unwrap().is_empty());
    assert_eq!(handler.seen().len(), 1);
    task.abort();
}

#[tokio::test]
async fn default_handlers_replay_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/evaluations"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/beneficiaries/5"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let queue = manager();
    queue.register_default_handlers(
        Arc::new(ReqwestClient::new().unwrap()),
        &server.uri(),
        Arc::new(StaticToken("tok".into())),
    );
    assert_eq!(queue.tags().len(), 5);

    queue
        .enqueue("evaluation-sync", json!({"score": 1}), EnqueueOptions::new())
        .await
        .unwrap();
    queue
        .enqueue(
            "beneficiary-sync",
            json!(null),
            EnqueueOptions::new()
                .operation(Operation::Delete)
                .record_id("5"),
        )
        .await
        .unwrap();

    for (tag, result) in queue.drain_all().await {
        let report = result.unwrap();
        assert_eq!(report.failed, 0, "{tag}");
    }
    assert!(queue.pending(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_drain_of_same_tag_is_skipped() {
    let queue = manager();
    queue.register_handler(
        "t",
        Arc::new(SlowHandler {
            delay: Duration::from_millis(200),
        }),
    );
    queue
        .enqueue("t", json!({}), EnqueueOptions::new())
        .await
        .unwrap();

    let running = tokio::spawn({
        let queue = queue.clone();
        async move { queue.drain("t").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = queue.drain("t").await.unwrap();
    assert!(second.skipped);
    assert_eq!(second.attempted, 0);

    let first = running.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.succeeded, 1);
}

#[tokio::test]
async fn enqueue_registers_replay_trigger() {
    let registrar = Arc::new(RecordingRegistrar::default());
    let queue = manager().with_registrar(registrar.clone());

    queue
        .enqueue("evaluation-sync", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(*registrar.tags.lock().unwrap(), vec!["evaluation-sync"]);
}

#[tokio::test]
async fn refused_registration_still_queues() {
    let registrar = Arc::new(RecordingRegistrar {
        refuse: true,
        ..Default::default()
    });
    let queue = manager().with_registrar(registrar.clone());

    let id = queue
        .enqueue("evaluation-sync", json!({}), EnqueueOptions::new())
        .await
        .unwrap();
    assert_eq!(registrar.tags.lock().unwrap().len(), 1);
    let pending = queue.pending(None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
}
