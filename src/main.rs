//! Process entrypoints.
//!
//! `serve` runs a single-node deployment: internal gateway, sync worker
//! and broker-event forwarding in one process over the bundled in-memory
//! backends. `worker` runs the sync consumer alone, publishing
//! notifications through the broker; it expects external queue and
//! broker adapters to be mounted for real multi-process deployments.

use anyhow::Result;
use clap::{Parser, Subcommand};
use sheetmind::analytics::AnalyticsCache;
use sheetmind::cache::{CacheStore, MemCache};
use sheetmind::config::Config;
use sheetmind::connections::ConnectionRepo;
use sheetmind::gateway::{self, GatewayState};
use sheetmind::limiter::RateLimiter;
use sheetmind::notify::{
    BrokerNotifier, LocalNotifier, LogTransport, Notifier, TransportEmitter, forward_broker_events,
};
use sheetmind::sheets::{HttpSheetSource, StaticTokenProvider};
use sheetmind::store::{DocumentStore, MemStore};
use sheetmind::sync::{CrawlerService, MemQueue, SyncWorker};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sheetmind", version = sheetmind::VERSION)]
#[command(about = "Sheet-backed analytics and conversational insights backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the request-handling process (gateway + in-process worker).
    Serve,
    /// Run a dedicated sync worker process.
    Worker,
}

struct Components {
    repo: ConnectionRepo,
    queue: Arc<MemQueue>,
    worker: Arc<SyncWorker>,
}

fn build_components(
    config: &Config,
    cache: Arc<dyn CacheStore>,
    notifier: Arc<dyn Notifier>,
) -> Result<Components> {
    let store: Arc<dyn DocumentStore> = Arc::new(MemStore::new());
    let repo = ConnectionRepo::new(store);
    let queue = Arc::new(MemQueue::new());

    let tokens = Arc::new(StaticTokenProvider(config.sheets.credentials.clone()));
    let sheets = Arc::new(HttpSheetSource::new(tokens)?);
    let crawler = Arc::new(CrawlerService::new(
        repo.clone(),
        sheets,
        notifier,
        AnalyticsCache::new(cache),
    ));
    let limiter = Arc::new(RateLimiter::with_defaults(config.limiter.safety_factor));
    let worker = Arc::new(SyncWorker::new(queue.clone(), limiter, crawler));

    Ok(Components { repo, queue, worker })
}

async fn run_serve(config: Config) -> Result<()> {
    let cache: Arc<dyn CacheStore> = Arc::new(MemCache::new());
    let transport: Arc<dyn TransportEmitter> = Arc::new(LogTransport);
    let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new(transport.clone()));
    let components = build_components(&config, cache.clone(), notifier)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let worker = tokio::spawn(components.worker.clone().run_until(shutdown_rx.clone()));
    tokio::spawn(forward_broker_events(cache, transport));

    let listener =
        TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let state = GatewayState::new(
        config.internal_api_key.clone(),
        components.repo.clone(),
        components.queue.clone(),
    );

    let mut shutdown = shutdown_rx;
    tokio::select! {
        result = gateway::serve(listener, state) => {
            result?;
        }
        _ = shutdown.changed() => {}
    }

    // Let an in-flight sync run to its terminal event before exiting.
    let _ = worker.await;
    Ok(())
}

async fn run_worker(config: Config) -> Result<()> {
    let cache: Arc<dyn CacheStore> = Arc::new(MemCache::new());
    let notifier: Arc<dyn Notifier> = Arc::new(BrokerNotifier::new(cache.clone()));
    let components = build_components(&config, cache, notifier)?;
    warn!(
        "running with the bundled in-memory queue; mount an external queue adapter \
         for multi-process deployments"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    components.worker.clone().run_until(shutdown_rx).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    info!("sheetmind {} starting", sheetmind::VERSION);

    match cli.command {
        Command::Serve => run_serve(config).await,
        Command::Worker => run_worker(config).await,
    }
}
