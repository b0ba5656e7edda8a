//! Error Module
//!
//! Defines error types and result types used throughout the hosting proxy.

use thiserror::Error;

/// Main error type for the hosting proxy
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rules error: {0}")]
    RulesError(String),

    #[error("XML error: {0}")]
    XmlError(String),

    #[error("Auth error: {0}")]
    AuthError(String),

    #[error("Origin error: {0}")]
    OriginError(String),

    #[error("Origin contract violation: {0}")]
    OriginContract(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::RulesError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl From<regex::Error> for ProxyError {
    fn from(err: regex::Error) -> Self {
        ProxyError::RulesError(err.to_string())
    }
}

/// Result type alias for the hosting proxy
pub type Result<T> = std::result::Result<T, ProxyError>;
