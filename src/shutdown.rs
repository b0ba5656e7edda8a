//! Graceful Shutdown Module
//!
//! Listens for SIGINT/SIGTERM and fans the signal out to the accept loop
//! over a broadcast channel.

use crate::{ProxyError, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shutdown coordinator for graceful system shutdown
pub struct ShutdownCoordinator {
    shutdown_sender: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        Self { shutdown_sender }
    }

    /// Get a shutdown signal for a component to wait on
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.shutdown_sender.subscribe())
    }

    /// Block until SIGINT or SIGTERM arrives, then broadcast shutdown
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint =
            signal::unix::signal(signal::unix::SignalKind::interrupt()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGINT handler: {}", e))
            })?;

        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).map_err(|e| {
                ProxyError::SystemError(format!("Failed to create SIGTERM handler: {}", e))
            })?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
        }

        if let Err(e) = self.shutdown_sender.send(()) {
            // No receivers left; normal during teardown
            debug!("Shutdown signal not sent (no active receivers): {}", e);
        }
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half handed to components that must stop on shutdown
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    pub async fn wait_for_shutdown(&mut self) {
        let _ = self.receiver.recv().await;
    }
}
