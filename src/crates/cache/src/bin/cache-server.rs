//! Cache server binary
//!
//! Standalone artifact cache speaking the HTTP surface, for deployments
//! where workers share a cache instead of embedding one.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use cache::{
    create_router, AppState, ArtifactCache, CacheServiceConfig, FilesystemStorage, MemoryStorage,
    ObjectStoreStorage, StorageBackend, StorageType,
};
use protocol::Shutdown;

#[derive(Parser)]
#[command(name = "cache-server", about = "gantry artifact cache server")]
struct Args {
    /// Path to the JSON configuration file; environment defaults when absent
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let args = Args::parse();
    let config = CacheServiceConfig::load(args.config.as_deref())?;
    info!(
        storage = ?config.storage_type,
        max_cache_size = config.max_cache_size,
        "loaded cache configuration"
    );

    let storage: Arc<dyn StorageBackend> = match config.storage_type {
        StorageType::Filesystem => Arc::new(FilesystemStorage::new(&config.storage_dir).await?),
        StorageType::Memory => Arc::new(MemoryStorage::new()),
        StorageType::ObjectStore => Arc::new(ObjectStoreStorage::new(
            config
                .object_store_url
                .clone()
                .expect("validated object_store_url"),
        )),
    };
    let cache = Arc::new(ArtifactCache::open(storage, config.limits()).await?);

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let sweeper = cache.spawn_sweeper(
        Duration::from_secs(config.cleanup_period_seconds),
        shutdown.clone(),
    );

    let state = AppState {
        cache: Arc::clone(&cache),
        auth_token: config
            .authentication
            .then(|| config.auth_token.clone().map(Arc::new))
            .flatten(),
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    info!(addr = %config.bind_addr(), "cache server listening");

    let wait_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_shutdown.wait().await })
        .await?;

    shutdown.trigger();
    let _ = sweeper.await;
    info!("cache server shut down gracefully");
    Ok(())
}
