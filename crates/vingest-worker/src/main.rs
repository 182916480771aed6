//! Import worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vingest_fetch::{
    DownloaderUpdater, EgressPool, EgressPoolConfig, SourceFetcher,
};
use vingest_fetch::drive::DriveConfig;
use vingest_fetch::platform::PlatformConfig;
use vingest_origin::OriginClient;
use vingest_queue::{ImportQueue, RecoveryStore};
use vingest_worker::pipeline::WorkerContext;
use vingest_worker::{CatalogClient, CatalogConfig, ImportConfig, ImportExecutor, MemoryWatchdog};

#[tokio::main]
async fn main() {
    // Install rustls crypto provider (required for TLS/HTTPS)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vingest=info".parse().unwrap());

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting vingest-worker");

    let config = ImportConfig::from_env();
    info!(environment = %config.environment, concurrency = config.concurrency, "Worker config loaded");

    let queue = match ImportQueue::from_env() {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("Failed to create import queue: {}", e);
            std::process::exit(1);
        }
    };

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let recovery = match RecoveryStore::new(&redis_url) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            error!("Failed to create recovery store: {}", e);
            std::process::exit(1);
        }
    };

    let origin = match OriginClient::from_env() {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!("Failed to create origin client: {}", e);
            std::process::exit(1);
        }
    };

    let egress = Arc::new(EgressPool::new(EgressPoolConfig::from_env()));
    let platform_config = PlatformConfig::from_env();

    // Let the control plane refresh the downloader binary before work
    // starts; failures only log.
    let updater = DownloaderUpdater::new(
        std::env::var("ADMIN_API_URL").ok(),
        std::env::var("ADMIN_API_SECRET").ok(),
        platform_config.downloader_bin.clone(),
    );
    updater.maybe_update().await;

    let fetcher = Arc::new(SourceFetcher::new(
        DriveConfig::from_env(),
        platform_config,
        Arc::clone(&egress),
    ));
    let catalog = Arc::new(CatalogClient::new(CatalogConfig::from_env()));

    // Observability only; the watchdog never kills the process.
    tokio::spawn(MemoryWatchdog::new(config.max_memory).run());

    let executor = Arc::new(ImportExecutor::new(WorkerContext {
        queue,
        recovery,
        fetcher,
        origin,
        catalog,
        config,
    }));

    let shutdown_handle = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received shutdown signal");
            executor.shutdown();
        })
    };

    if let Err(e) = executor.run().await {
        error!("Executor error: {}", e);
        std::process::exit(1);
    }

    shutdown_handle.abort();
    info!("Worker shutdown complete");
}
