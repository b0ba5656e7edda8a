use gcs_hosting_proxy::config::Config;
use gcs_hosting_proxy::logging;
use gcs_hosting_proxy::server::{AppState, HostingServer};
use gcs_hosting_proxy::shutdown::ShutdownCoordinator;
use gcs_hosting_proxy::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _log_guard = logging::init(&config.logging)?;

    info!("Starting gcs-hosting-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("HTTP port: {}", config.server.http_port);
    info!("Origin endpoint: {}", config.origin.endpoint);
    if config.server.blob_offload_enabled {
        info!("Blob-handle offload enabled");
    }

    let state = Arc::new(AppState::from_config(&config)?);

    // Bind to [::] for IPv6 dual-stack (accepts both IPv4 and IPv6)
    let addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], config.server.http_port));
    let server = HostingServer::new(addr, state);

    let coordinator = ShutdownCoordinator::new();
    let server_shutdown = coordinator.subscribe();
    let shutdown_task = tokio::spawn(async move {
        if let Err(e) = coordinator.listen_for_shutdown().await {
            error!("Shutdown listener failed: {}", e);
        }
    });

    server.start(server_shutdown).await?;
    shutdown_task.abort();

    info!("Shutdown complete");
    Ok(())
}
