//! GCS Hosting Proxy - Firebase-Hosting-compatible static website server
//!
//! Serves static websites out of Google Cloud Storage buckets: each
//! request's host names a bucket, per-bucket hosting rules (redirects,
//! rewrites, headers, clean URLs, trailing slashes) shape the URL space,
//! and RFC 7232 conditional semantics are honored against a mutable
//! origin.

pub mod conditions;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extglob;
pub mod firebase;
pub mod handler;
pub mod logging;
pub mod origin;
pub mod resolver;
pub mod server;
pub mod shutdown;
pub mod website;

pub use error::{ProxyError, Result};
