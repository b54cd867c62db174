use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use mb_core::{Clock, SystemClock};
use mb_engine::catalog::Catalog;
use mb_engine::config::MemoboxConfig;
use mb_engine::tasks::{EnrichmentWorker, TaskQueue, WorkerConfig};
use mb_engine::vision::OpenAiVision;
use mb_storage::{DiskBlobStore, SqliteStore};

use mb_server::rest::create_router;
use mb_server::state::AppState;

#[derive(Parser)]
#[command(name = "memobox", about = "Image-asset catalog with an AI enrichment pipeline")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8520)]
    port: u16,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = MemoboxConfig::load(args.config.as_deref())?;

    if let Some(parent) = Path::new(&config.database_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(Path::new(&config.database_path))?);
    let blobs = Arc::new(DiskBlobStore::new(&config.storage_path));
    let vision = Arc::new(OpenAiVision::from_config(&config.vision));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue = Arc::new(TaskQueue::new(store.clone(), clock.clone()));
    let catalog = Arc::new(Catalog::new(
        store.clone(),
        blobs.clone(),
        vision.clone(),
        clock,
        queue.clone(),
        config.clone(),
    ));
    catalog.initialize().await?;

    let worker = EnrichmentWorker::new(
        catalog.clone(),
        queue.clone(),
        blobs,
        vision,
        WorkerConfig::from_enrichment(&config.enrichment),
    );
    let (shutdown_tx, _) = broadcast::channel(4);
    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        async move { worker.run(shutdown_rx).await }
    });

    let state = Arc::new(AppState {
        catalog,
        queue,
        overrides: worker.overrides(),
        upload_token: config.upload_token.clone(),
        base_url: config.base_url.clone(),
    });
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "memobox server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Stop the worker and wait for in-flight tasks to settle.
    let _ = shutdown_tx.send(());
    worker_handle.await?;
    Ok(())
}
