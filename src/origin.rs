//! Origin Client Module
//!
//! Authenticated HTTP client for the object store: `HEAD`/`GET` on
//! `{bucket}{object}` plus the `?websiteConfig` bucket read. Carries a
//! read-only bearer token taken from the environment or fetched from the
//! metadata server. The connector speaks TLS for `https` endpoints and
//! plain TCP for `http` ones, so a local stub origin can stand in during
//! tests.

use crate::website::{parse_website_config, WebsiteConfiguration};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::pki_types::ServerName;
use serde::Deserialize;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tower::Service;
use tracing::{debug, error, warn};

/// Response metadata (and optionally body) from one origin call
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Incoming>,
}

impl OriginResponse {
    /// A bodyless, headerless response carrying only a status code
    pub fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    fn from_response(response: Response<Incoming>, keep_body: bool) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body: keep_body.then_some(body),
        }
    }

    /// Header value as a string, empty when absent or non-ASCII
    pub fn header_str(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn stored_content_encoding(&self) -> &str {
        self.header_str("x-goog-stored-content-encoding")
    }

    /// The store reports directory placeholders as zero stored length
    pub fn stored_length_is_zero(&self) -> bool {
        self.header_str("x-goog-stored-content-length") == "0"
    }
}

/// The object store as seen by the resolver and dispatcher.
#[allow(async_fn_in_trait)]
pub trait ObjectStore: Send + Sync {
    /// Metadata-only probe of `{bucket}{object}`
    async fn head_object(&self, bucket: &str, object: &str) -> Result<OriginResponse>;
    /// Full read of `{bucket}{object}` with a streaming body
    async fn get_object(&self, bucket: &str, object: &str) -> Result<OriginResponse>;
    /// The bucket's website configuration document
    async fn get_bucket_website(&self, bucket: &str) -> Result<WebsiteConfiguration>;
}

/// Stream to the origin: TLS for https endpoints, plain TCP for http
pub enum OriginStream {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl Read for OriginStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut tokio_buf = tokio::io::ReadBuf::uninit(unsafe { buf.as_mut() });
        let result = match &mut *self {
            OriginStream::Plain(stream) => Pin::new(stream).poll_read(cx, &mut tokio_buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_read(cx, &mut tokio_buf),
        };
        match result {
            Poll::Ready(Ok(())) => {
                let filled = tokio_buf.filled().len();
                unsafe {
                    buf.advance(filled);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for OriginStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            OriginStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            OriginStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl Connection for OriginStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector implementing the tower::Service trait required by the hyper
/// client. TLS configuration uses the system root certificates.
#[derive(Clone)]
pub struct OriginConnector {
    tls_connector: TlsConnector,
}

impl OriginConnector {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                for cert in certs {
                    if let Err(e) = root_store.add(cert) {
                        warn!("Skipping unparseable root certificate: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to load native root certificates: {}", e);
            }
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
        })
    }
}

impl Service<Uri> for OriginConnector {
    type Response = OriginStream;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls_connector = self.tls_connector.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| ProxyError::ConfigError("No host in URI".to_string()))?
                .to_string();
            let https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

            let tcp = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|e| {
                    ProxyError::ConnectionError(format!(
                        "Failed to connect to {}:{}: {}",
                        host, port, e
                    ))
                })?;

            // Lower latency for small metadata probes
            if let Err(e) = tcp.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}:{}: {}", host, port, e);
            }

            if !https {
                return Ok(OriginStream::Plain(tcp));
            }

            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                ProxyError::TlsError(format!("Invalid server name '{}': {}", host, e))
            })?;

            let tls = tls_connector.connect(server_name, tcp).await.map_err(|e| {
                ProxyError::TlsError(format!("TLS handshake failed to {}: {}", host, e))
            })?;

            Ok(OriginStream::Tls(tls))
        })
    }
}

/// Bearer-token source for origin calls
enum TokenSource {
    /// No Authorization header (local stub origins)
    Anonymous,
    /// Fixed token taken from the environment at startup
    Static(String),
    /// Token fetched from the metadata server, cached until near expiry
    Metadata {
        endpoint: String,
        scope: String,
        cached: Mutex<Option<CachedToken>>,
    },
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenReply {
    access_token: String,
    expires_in: u64,
}

/// Authenticated client for the object store
pub struct GcsClient {
    client: Client<OriginConnector, Full<Bytes>>,
    endpoint: String,
    request_timeout: Duration,
    token_source: TokenSource,
}

impl GcsClient {
    pub fn new(config: &crate::config::OriginConfig) -> Result<Self> {
        let connector = OriginConnector::new()?;
        let client = Client::builder(TokioExecutor::new()).build(connector);

        let token_source = if config.anonymous {
            TokenSource::Anonymous
        } else {
            match std::env::var(&config.token_env) {
                Ok(token) if !token.is_empty() => {
                    debug!("Using static origin token from ${}", config.token_env);
                    TokenSource::Static(token)
                }
                _ => TokenSource::Metadata {
                    endpoint: config.metadata_endpoint.trim_end_matches('/').to_string(),
                    scope: config.token_scope.clone(),
                    cached: Mutex::new(None),
                },
            }
        };

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout,
            token_source,
        })
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::ConnectionError("Origin request timed out".to_string()))?
            .map_err(|e| ProxyError::ConnectionError(format!("Origin request failed: {}", e)))
    }

    async fn authorized_request(&self, method: Method, url: String) -> Result<Response<Incoming>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ProxyError::HttpError(format!("Invalid origin URL {}: {}", url, e)))?;

        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = self.access_token().await? {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| ProxyError::HttpError(e.to_string()))?;
        self.send(request).await
    }

    async fn access_token(&self) -> Result<Option<String>> {
        match &self.token_source {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata {
                endpoint,
                scope,
                cached,
            } => {
                let mut guard = cached.lock().await;
                if let Some(token) = guard.as_ref() {
                    if token.expires_at > Instant::now() {
                        return Ok(Some(token.token.clone()));
                    }
                }

                let url = format!(
                    "{}/computeMetadata/v1/instance/service-accounts/default/token?scopes={}",
                    endpoint, scope
                );
                let uri: Uri = url.parse().map_err(|e| {
                    ProxyError::AuthError(format!("Invalid metadata URL {}: {}", url, e))
                })?;
                let request = Request::builder()
                    .method(Method::GET)
                    .uri(uri)
                    .header("Metadata-Flavor", "Google")
                    .body(Full::new(Bytes::new()))
                    .map_err(|e| ProxyError::AuthError(e.to_string()))?;

                let response = self.send(request).await?;
                if response.status() != StatusCode::OK {
                    return Err(ProxyError::AuthError(format!(
                        "Metadata token fetch failed: {}",
                        response.status()
                    )));
                }

                let body = response
                    .into_body()
                    .collect()
                    .await
                    .map_err(|e| ProxyError::AuthError(format!("Metadata token read: {}", e)))?
                    .to_bytes();
                let reply: TokenReply = serde_json::from_slice(&body)
                    .map_err(|e| ProxyError::AuthError(format!("Metadata token parse: {}", e)))?;

                // Refresh a minute before the advertised expiry
                let expires_at =
                    Instant::now() + Duration::from_secs(reply.expires_in.saturating_sub(60));
                *guard = Some(CachedToken {
                    token: reply.access_token.clone(),
                    expires_at,
                });
                Ok(Some(reply.access_token))
            }
        }
    }
}

impl ObjectStore for GcsClient {
    async fn head_object(&self, bucket: &str, object: &str) -> Result<OriginResponse> {
        let response = self
            .authorized_request(Method::HEAD, format!("{}/{}{}", self.endpoint, bucket, object))
            .await
            .map_err(|e| {
                error!("HEAD {}{}: {}", bucket, object, e);
                e
            })?;
        Ok(OriginResponse::from_response(response, false))
    }

    async fn get_object(&self, bucket: &str, object: &str) -> Result<OriginResponse> {
        let response = self
            .authorized_request(Method::GET, format!("{}/{}{}", self.endpoint, bucket, object))
            .await
            .map_err(|e| {
                error!("GET {}{}: {}", bucket, object, e);
                e
            })?;
        Ok(OriginResponse::from_response(response, true))
    }

    async fn get_bucket_website(&self, bucket: &str) -> Result<WebsiteConfiguration> {
        let response = self
            .authorized_request(
                Method::GET,
                format!("{}/{}?websiteConfig", self.endpoint, bucket),
            )
            .await
            .map_err(|e| {
                error!("GET {}?websiteConfig: {}", bucket, e);
                e
            })?;

        if response.status() != StatusCode::OK {
            let reason = response
                .status()
                .canonical_reason()
                .unwrap_or("unknown status");
            error!("GET {}?websiteConfig: {}", bucket, reason);
            return Err(ProxyError::OriginError(format!(
                "GET {}?websiteConfig: {}",
                bucket, reason
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ProxyError::HttpError(format!("websiteConfig read: {}", e)))?
            .to_bytes();
        let text = std::str::from_utf8(&body)
            .map_err(|e| ProxyError::XmlError(format!("websiteConfig not UTF-8: {}", e)))?;
        parse_website_config(text).map_err(|e| {
            error!("Decode {}?websiteConfig: {}", bucket, e);
            e
        })
    }
}
