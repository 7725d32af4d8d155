//! huginnd: Huginn daemon.
//!
//! Hosts an [`EdgeCache`](huginn::EdgeCache) and the configured local-first
//! stores, runs their background tasks, and serves JSON-line commands on
//! stdin. Each reply is one JSON line on stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use huginn::edge::{Command, CommandHandle};
use huginn::net::{NoToken, ReqwestClient, StaticToken, TokenProvider};
use huginn::store::StoreContext;
use huginn::{
    Config, Connectivity, EdgeCache, HttpClient, HuginnError, Secrets, SnapshotStorage,
    StoreManager, SyncQueueManager,
};

/// File name of the storage snapshot inside the data directory.
const SNAPSHOT_FILE: &str = "huginn.json";

/// Huginn daemon: offline-first edge cache and sync engine.
#[derive(Parser)]
#[command(name = "huginnd")]
#[command(version = huginn::PKG_VERSION)]
#[command(about = "Huginn offline-first cache and sync daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the storage snapshot (overrides the configuration).
    #[arg(long, env = "HUGINN_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

/// Daemon-level requests in addition to the edge cache commands.
#[derive(Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
enum StoreRequest {
    SyncStores {
        #[serde(default)]
        force: bool,
    },
    GetStoreStats,
    SetOnline {
        online: bool,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Request {
    Edge(Command),
    Store(StoreRequest),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(args.config.as_deref())?;
    let secrets = Secrets::load()?;

    let data_dir = args.data_dir.unwrap_or_else(|| config.remote.data_dir());
    std::fs::create_dir_all(&data_dir)?;
    let storage = Arc::new(SnapshotStorage::open(data_dir.join(SNAPSHOT_FILE))?);

    let client: Arc<dyn HttpClient> =
        Arc::new(ReqwestClient::with_timeout(config.remote.request_timeout)?);
    let token: Arc<dyn TokenProvider> = match secrets.api_token() {
        Some(token) => Arc::new(StaticToken(token)),
        None => Arc::new(NoToken),
    };
    let connectivity = Connectivity::online();

    let queue = SyncQueueManager::with_config(storage.clone(), config.queue.clone());
    queue.register_default_handlers(Arc::clone(&client), &config.remote.base_url, Arc::clone(&token));

    let cache = EdgeCache::builder()
        .config(config.edge.clone())
        .client(Arc::clone(&client))
        .retry(config.retry.clone())
        .queue(queue.clone())
        .build()?;

    let ctx = StoreContext::new(storage, client, config.remote.base_url.clone())
        .with_token(token)
        .with_connectivity(connectivity.clone());
    let mut stores = StoreManager::new(ctx);
    for store in &config.stores {
        stores.open(store.clone())?;
    }

    let mut tasks = vec![
        cache.spawn_sweeper(config.edge.sweep_interval),
        queue.spawn_replay_on_reconnect(&connectivity),
    ];
    if let Some(interval) = config.queue.drain_interval {
        tasks.push(queue.spawn_periodic_drain(interval, connectivity.clone()));
    }
    tasks.extend(stores.spawn_online_listeners());

    info!(
        version = huginn::version_string(),
        data_dir = %data_dir.display(),
        stores = ?stores.names(),
        "huginnd starting"
    );

    let (commands, _loop) = cache.spawn_command_loop();
    serve_stdin(&commands, &stores, &connectivity).await?;

    info!("stdin closed, shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn serve_stdin(
    commands: &CommandHandle,
    stores: &StoreManager,
    connectivity: &Connectivity,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(request, commands, stores, connectivity).await,
            Err(e) => Err(HuginnError::InvalidInput(format!("unrecognised request: {e}"))),
        };
        let reply = match reply {
            Ok(result) => json!({ "ok": true, "result": result }),
            Err(e) => {
                warn!(error = %e, "request failed");
                json!({ "ok": false, "error": e.to_string() })
            }
        };
        stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn dispatch(
    request: Request,
    commands: &CommandHandle,
    stores: &StoreManager,
    connectivity: &Connectivity,
) -> huginn::Result<Value> {
    match request {
        Request::Edge(command) => commands.send(command).await,
        Request::Store(StoreRequest::SyncStores { force }) => {
            let mut reports = serde_json::Map::new();
            for (name, result) in stores.sync_all(force).await {
                let value = match result {
                    Ok(report) => serde_json::to_value(report)?,
                    Err(e) => json!({ "error": e.to_string() }),
                };
                reports.insert(name, value);
            }
            Ok(Value::Object(reports))
        }
        Request::Store(StoreRequest::GetStoreStats) => {
            let mut stats = serde_json::Map::new();
            for (name, result) in stores.all_stats().await {
                stats.insert(name, serde_json::to_value(result?)?);
            }
            Ok(Value::Object(stats))
        }
        Request::Store(StoreRequest::SetOnline { online }) => {
            connectivity.set_online(online);
            Ok(json!({ "online": online }))
        }
    }
}
