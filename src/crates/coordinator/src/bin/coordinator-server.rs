//! Coordinator server binary
//!
//! Runs the HTTP API, the worker-facing control RPC listener, the dispatch
//! loop, and the failure-detection reaper until INT/TERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use coordinator::{
    api::{create_router, AppState},
    rpc, spawn_dispatch_loop, spawn_reaper, Coordinator, CoordinatorConfig,
    StaticTokenAuthenticator,
};
use protocol::Shutdown;

#[derive(Parser)]
#[command(name = "coordinator-server", about = "gantry build coordinator")]
struct Args {
    /// Path to the JSON configuration file; environment defaults when absent
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let args = Args::parse();
    let config = CoordinatorConfig::load(args.config.as_deref())?;
    info!(
        http_port = config.http_port,
        rpc_port = config.rpc_port,
        max_workers = config.max_workers,
        queue_capacity = config.queue_capacity,
        "loaded coordinator configuration"
    );

    let auth = config
        .authentication
        .then(|| config.auth_token.clone())
        .flatten()
        .map(|token| StaticTokenAuthenticator::new(token) as Arc<dyn coordinator::Authenticator>);

    let rpc_addr = format!("0.0.0.0:{}", config.rpc_port);
    let http_addr = format!("0.0.0.0:{}", config.http_port);
    let coordinator = Coordinator::new(config);

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let rpc_listener = tokio::net::TcpListener::bind(&rpc_addr).await?;
    let rpc_task = tokio::spawn(rpc::serve(
        Arc::clone(&coordinator),
        rpc_listener,
        shutdown.clone(),
    ));
    let dispatch_task = spawn_dispatch_loop(Arc::clone(&coordinator), shutdown.clone());
    let reaper_task = spawn_reaper(Arc::clone(&coordinator), shutdown.clone());

    let app = create_router(AppState {
        coordinator: Arc::clone(&coordinator),
        auth,
    });
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!(addr = %http_addr, "coordinator HTTP API listening");

    let wait_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_shutdown.wait().await })
        .await?;

    shutdown.trigger();
    let _ = rpc_task.await;
    let _ = dispatch_task.await;
    let _ = reaper_task.await;
    info!("coordinator shut down gracefully");
    Ok(())
}
