//! HTTP Server Module
//!
//! Accept loop and per-connection service for the hosting proxy. Each
//! request is mapped to a bucket via its Host header, gated to GET/HEAD,
//! and handed to the request handler; short handler results are rendered
//! here into minimal responses.

use crate::config::Config;
use crate::dispatch::{empty_body, full_body, BlobDelegate, GsPathDelegate, ProxyBody};
use crate::firebase::FirebaseRules;
use crate::handler::{serve_website, HandlerReply, HttpResult};
use crate::origin::GcsClient;
use crate::shutdown::ShutdownSignal;
use crate::website::WebsiteCatalog;
use crate::{ProxyError, Result};
use bytes::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared per-process state: immutable rules, the lazy website-config
/// catalog, and the origin client.
pub struct AppState {
    pub rules: FirebaseRules,
    pub catalog: WebsiteCatalog,
    pub origin: GcsClient,
    pub blob_delegate: Option<Box<dyn BlobDelegate>>,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Self> {
        let rules = FirebaseRules::load(&config.rules.path)?;
        let origin = GcsClient::new(&config.origin)?;
        let blob_delegate: Option<Box<dyn BlobDelegate>> = if config.server.blob_offload_enabled {
            Some(Box::new(GsPathDelegate))
        } else {
            None
        };
        Ok(Self {
            rules,
            catalog: WebsiteCatalog::new(),
            origin,
            blob_delegate,
        })
    }
}

/// The static website server
pub struct HostingServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl HostingServer {
    pub fn new(addr: SocketAddr, state: Arc<AppState>) -> Self {
        Self { addr, state }
    }

    /// Run the accept loop until the shutdown signal fires.
    pub async fn start(&self, mut shutdown: ShutdownSignal) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            ProxyError::IoError(format!("Failed to bind {}: {}", self.addr, e))
        })?;

        info!("Static website server listening on {}", self.addr);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, peer) = accept_result.map_err(|e| {
                        ProxyError::IoError(format!("Failed to accept connection: {}", e))
                    })?;
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        handle_connection(stream, peer, state).await;
                    });
                }
                _ = shutdown.wait_for_shutdown() => {
                    info!("Server received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<AppState>) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(req, peer, state).await) }
    });

    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        let err_str = err.to_string();
        if err_str.contains("connection closed")
            || err_str.contains("broken pipe")
            || err_str.contains("reset by peer")
            || err.is_canceled()
        {
            debug!("Client disconnected from {}: {}", peer, err);
        } else {
            error!("Error serving HTTP connection from {}: {}", peer, err);
        }
    }
}

/// Handle a single HTTP request.
pub async fn handle_request<B>(
    req: Request<B>,
    peer: SocketAddr,
    state: Arc<AppState>,
) -> Response<ProxyBody> {
    let request_id = Uuid::new_v4();
    let start = std::time::Instant::now();
    let (parts, _body) = req.into_parts();

    let bucket = bucket_from_host(&parts.headers);

    let response = if parts.method != Method::GET && parts.method != Method::HEAD {
        warn!("Unsupported method: {}", parts.method);
        let mut response = short_response(HttpResult::status(StatusCode::METHOD_NOT_ALLOWED));
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        response
    } else {
        match &bucket {
            None => {
                warn!("Missing or invalid Host header from {}", peer);
                short_response(HttpResult::with_message(
                    StatusCode::BAD_REQUEST,
                    "Host header is required".to_string(),
                ))
            }
            Some(bucket) => {
                let reply = serve_website(
                    &parts,
                    bucket,
                    &state.origin,
                    &state.catalog,
                    &state.rules,
                    state.blob_delegate.as_deref(),
                )
                .await;
                match reply {
                    HandlerReply::Full(response) => response,
                    HandlerReply::Short(result) => short_response(result),
                }
            }
        }
    };

    info!(
        request_id = %request_id,
        peer = %peer,
        method = %parts.method,
        bucket = bucket.as_deref().unwrap_or("-"),
        path = %parts.uri.path(),
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );

    response
}

/// Render a short handler result into a minimal response.
pub fn short_response(result: HttpResult) -> Response<ProxyBody> {
    let status =
        StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let body = match &result.message {
        Some(message) if !message.is_empty() => full_body(Bytes::from(message.clone())),
        _ => empty_body(),
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;

    if let Some(location) = result.location {
        match HeaderValue::from_str(&location) {
            Ok(value) => {
                response.headers_mut().insert(header::LOCATION, value);
            }
            Err(e) => {
                error!("Invalid redirect location {:?}: {}", location, e);
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }

    response
}

/// The bucket is the request's host with any port stripped.
fn bucket_from_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}
