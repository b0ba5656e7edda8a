//! Logging Module
//!
//! Initializes the tracing subscriber from configuration: an `EnvFilter`
//! driven by `RUST_LOG` (falling back to the configured level) and an
//! optional daily-rolling application log file.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize global logging.
///
/// Returns the appender worker guard when file logging is enabled; the
/// caller must keep it alive for the process lifetime or buffered lines
/// are lost on exit.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| {
            ProxyError::ConfigError(format!("Invalid log level {:?}: {}", config.log_level, e))
        })?;

    match &config.app_log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                ProxyError::IoError(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = rolling::daily(dir, "hosting-proxy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| ProxyError::SystemError(format!("Failed to init logging: {}", e)))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init()
                .map_err(|e| ProxyError::SystemError(format!("Failed to init logging: {}", e)))?;
            Ok(None)
        }
    }
}
