//! Build worker binary
//!
//! Registers with the coordinator, serves the control RPC surface, and
//! runs builds until INT/TERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use protocol::Shutdown;
use worker::{heartbeat, rpc, BuildExecutor, WorkerConfig};

#[derive(Parser)]
#[command(name = "build-worker", about = "gantry build worker")]
struct Args {
    /// Path to the JSON configuration file; environment defaults when absent
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let args = Args::parse();
    let config = Arc::new(WorkerConfig::load(args.config.as_deref())?);
    info!(
        worker_id = %config.worker_id,
        coordinator = %config.coordinator_address,
        rpc_port = config.rpc_port,
        "loaded worker configuration"
    );

    let executor = Arc::new(BuildExecutor::new(Arc::clone(&config)).await?);

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown.clone().listen_for_signals());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.rpc_port)).await?;
    let rpc_task = tokio::spawn(rpc::serve(
        Arc::clone(&executor),
        listener,
        shutdown.clone(),
    ));
    let heartbeat_task =
        heartbeat::spawn_heartbeat_loop(Arc::clone(&config), Arc::clone(&executor), shutdown);

    let _ = rpc_task.await;
    let _ = heartbeat_task.await;
    info!("worker shut down gracefully");
    Ok(())
}
