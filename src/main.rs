use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vitalink::api::RestApi;
use vitalink::config::load_config;
use vitalink::{Error, StorageEngine};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = load_config(Path::new("config.yaml"))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &config.storage.path {
        Some(path) => info!(path = %path.display(), "Starting Vitalink"),
        None => info!("Starting Vitalink with memory-only storage"),
    }

    let storage = Arc::new(StorageEngine::open(&config.storage)?);
    let api = RestApi::from_config(Arc::clone(&storage), &config);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .map_err(|e| Error::Address(format!("{}:{} ({})", config.api.host, config.api.port, e)))?;
    info!(%addr, "Starting server");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (_, server) = warp::serve(api.routes())
        .try_bind_with_graceful_shutdown(addr, async move {
            shutdown_rx.await.ok();
            info!("Shutting down server");
        })?;
    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");
    shutdown_tx.send(()).ok();

    if let Err(e) = server_handle.await {
        error!(error = %e, "Server task failed");
    }

    info!("Flushing data to disk");
    if let Err(e) = storage.flush_all() {
        error!(error = %e, "Error flushing data");
    } else {
        info!("Data successfully flushed to disk");
    }

    info!("Server shutdown complete");
    Ok(())
}
