//! Configuration Module
//!
//! Handles configuration loading from a YAML file, environment variables,
//! and command-line arguments.

use crate::{ProxyError, Result};
use clap::{Arg, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_port: u16,
    /// Advertise stored bytes by blob handle instead of streaming them,
    /// when the fronting runtime supports `X-AppEngine-BlobKey` delegation.
    pub blob_offload_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            blob_offload_enabled: false,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.http_port == 0 {
            return Err("Server http_port must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Object-store origin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Base endpoint of the object store, e.g. `https://storage.googleapis.com`
    pub endpoint: String,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
    /// Environment variable consulted for a static bearer token
    pub token_env: String,
    /// Metadata server queried for a token when the env variable is unset
    pub metadata_endpoint: String,
    /// OAuth scope requested from the metadata server
    pub token_scope: String,
    /// Skip authentication entirely (local stub origins)
    pub anonymous: bool,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            request_timeout: Duration::from_secs(30),
            token_env: "STORAGE_ACCESS_TOKEN".to_string(),
            metadata_endpoint: "http://metadata.google.internal".to_string(),
            token_scope: "https://www.googleapis.com/auth/devstorage.read_only".to_string(),
            anonymous: false,
        }
    }
}

impl OriginConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.endpoint.is_empty() {
            return Err("Origin endpoint cannot be empty".to_string());
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(format!(
                "Origin endpoint must be an http(s) URL, got {:?}",
                self.endpoint
            ));
        }
        if self.request_timeout.is_zero() {
            return Err("Origin request_timeout must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Firebase rules file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Path to the per-bucket rules file loaded at startup
    pub path: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("firebase.json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Optional directory for daily-rolling application log files
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            app_log_dir: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from command-line arguments and an optional YAML file.
    ///
    /// Precedence: `--config <file>` argument, then the `HOSTING_PROXY_CONFIG`
    /// environment variable, then built-in defaults.
    pub fn load() -> Result<Self> {
        let matches = Command::new("gcs-hosting-proxy")
            .about("Firebase-Hosting-compatible static website server fronting GCS buckets")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Path to the YAML configuration file"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("Override the HTTP listen port"),
            )
            .get_matches();

        let config_path = matches
            .get_one::<String>("config")
            .cloned()
            .or_else(|| std::env::var("HOSTING_PROXY_CONFIG").ok());

        let mut config = match config_path {
            Some(path) => Self::load_from_file(&PathBuf::from(path))?,
            None => {
                warn!("No configuration file specified, using defaults");
                Config::default()
            }
        };

        if let Some(port) = matches.get_one::<String>("port") {
            config.server.http_port = port
                .parse()
                .map_err(|e| ProxyError::ConfigError(format!("Invalid port {:?}: {}", port, e)))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate every configuration section
    pub fn validate(&self) -> Result<()> {
        self.server
            .validate()
            .map_err(ProxyError::ConfigError)?;
        self.origin
            .validate()
            .map_err(ProxyError::ConfigError)?;
        Ok(())
    }
}
