//! Response Dispatcher Module
//!
//! Builds the outgoing response once the resolver has committed to an
//! object: the configured not-found page, blob-handle delegation for
//! identity-encoded objects, or a streamed body. Also owns the
//! security-header baseline and the passthrough header set.

use crate::firebase::SiteRules;
use crate::origin::ObjectStore;
use crate::website::WebsiteConfiguration;
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::{HeaderMap, Response, StatusCode};
use std::time::SystemTime;
use tracing::error;

/// Response body type used throughout the server
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty_body() -> ProxyBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn stream_body(incoming: Incoming) -> ProxyBody {
    incoming
        .map_err(|e| {
            error!("Stream error: {}", e);
            e
        })
        .boxed()
}

/// Names the stored bytes for the fronting runtime so it can stream them
/// without this server touching the payload.
pub trait BlobDelegate: Send + Sync {
    /// A stable blob key for a `/gs/{bucket}{object}` path
    fn key_for(&self, gs_path: &str) -> Result<String>;
}

/// Delegate that hands the runtime the `/gs/` path itself as the key.
pub struct GsPathDelegate;

impl BlobDelegate for GsPathDelegate {
    fn key_for(&self, gs_path: &str) -> Result<String> {
        Ok(gs_path.to_string())
    }
}

/// Security-header baseline applied to every 200 and 404 body response
pub fn apply_security_headers(out: &mut HeaderMap) {
    out.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    out.insert(
        header::STRICT_TRANSPORT_SECURITY,
        HeaderValue::from_static("max-age=86400"),
    );
    out.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    out.insert(
        HeaderName::from_static("x-download-options"),
        HeaderValue::from_static("noopen"),
    );
    out.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("SAMEORIGIN"),
    );
    out.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
}

/// Copy the entity headers this proxy passes through from the origin
pub fn copy_entity_headers(origin: &HeaderMap, out: &mut HeaderMap) {
    for name in [
        header::CONTENT_TYPE,
        header::CONTENT_LANGUAGE,
        header::CONTENT_DISPOSITION,
    ] {
        for value in origin.get_all(&name) {
            out.append(name.clone(), value.clone());
        }
    }
}

pub fn copy_cache_control(origin: &HeaderMap, out: &mut HeaderMap) {
    for value in origin.get_all(header::CACHE_CONTROL) {
        out.append(header::CACHE_CONTROL, value.clone());
    }
}

/// The proxy's freshness model is request-scoped, so every body response
/// advertises the serving time, not the origin's mtime.
pub fn set_last_modified_now(out: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
        out.insert(header::LAST_MODIFIED, value);
    }
}

/// The `X-AppEngine-BlobRange` value to forward, if the request carried a
/// `Range` at all. The range is suppressed (empty value) when `If-Range`
/// matches neither validator, or when the origin is mutable.
fn blob_range_header(
    req_headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
    mutable: bool,
) -> Option<HeaderValue> {
    let range = req_headers.get(header::RANGE)?.to_str().ok()?;
    if range.is_empty() {
        return None;
    }

    let mut forwarded = range;
    if let Some(condition) = req_headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        if !condition.is_empty() && condition != etag && condition != last_modified {
            forwarded = "";
        }
    }
    if mutable {
        forwarded = "";
    }

    HeaderValue::from_str(forwarded).ok()
}

/// Delegate the body to the fronting runtime by blob key.
pub fn send_blob(
    delegate: &dyn BlobDelegate,
    bucket: &str,
    object: &str,
    req_headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
    mutable: bool,
    mut out_headers: HeaderMap,
) -> Result<Response<ProxyBody>> {
    let gs_path = format!("/gs/{}{}", bucket, object);
    let key = delegate.key_for(&gs_path).map_err(|e| {
        error!("Blob key for {}: {}", gs_path, e);
        e
    })?;

    if let Some(range) = blob_range_header(req_headers, etag, last_modified, mutable) {
        out_headers.insert(HeaderName::from_static("x-appengine-blobrange"), range);
    }
    out_headers.insert(
        HeaderName::from_static("x-appengine-blobkey"),
        HeaderValue::from_str(&key)
            .map_err(|e| ProxyError::HttpError(format!("Invalid blob key: {}", e)))?,
    );

    let mut response = Response::new(empty_body());
    *response.headers_mut() = out_headers;
    Ok(response)
}

/// Stream the object body from the origin. HEAD requests reuse the
/// metadata already resolved and skip the origin read.
pub async fn stream_object<S: ObjectStore>(
    store: &S,
    bucket: &str,
    object: &str,
    head: bool,
    out_headers: HeaderMap,
) -> Result<Response<ProxyBody>> {
    if head {
        let mut response = Response::new(empty_body());
        *response.headers_mut() = out_headers;
        return Ok(response);
    }

    let origin = store.get_object(bucket, object).await?;
    if origin.status != StatusCode::OK {
        let reason = origin.status.canonical_reason().unwrap_or("unknown status");
        error!("GET {}{}: {}", bucket, object, reason);
        return Err(ProxyError::OriginError(format!(
            "GET {}{}: {}",
            bucket, object, reason
        )));
    }

    let body = match origin.body {
        Some(incoming) => stream_body(incoming),
        None => empty_body(),
    };
    let mut response = Response::new(body);
    *response.headers_mut() = out_headers;
    Ok(response)
}

/// Serve the configured not-found page with status 404.
pub async fn send_not_found<S: ObjectStore>(
    store: &S,
    bucket: &str,
    website: &WebsiteConfiguration,
    rules: &SiteRules,
    head: bool,
) -> Result<Response<ProxyBody>> {
    let not_found_page = format!("/{}", website.not_found_page);

    let origin = store.get_object(bucket, &not_found_page).await.map_err(|e| {
        error!("GET {}{}: {}", bucket, not_found_page, e);
        e
    })?;
    if origin.status != StatusCode::OK {
        let reason = origin.status.canonical_reason().unwrap_or("unknown status");
        error!("GET {}{}: {}", bucket, not_found_page, reason);
        return Err(ProxyError::OriginError(format!(
            "GET {}{}: {}",
            bucket, not_found_page, reason
        )));
    }

    let mut out_headers = HeaderMap::new();
    copy_entity_headers(&origin.headers, &mut out_headers);
    apply_security_headers(&mut out_headers);
    rules.process_headers(&not_found_page, &mut out_headers);

    let body = if head {
        empty_body()
    } else {
        match origin.body {
            Some(incoming) => stream_body(incoming),
            None => empty_body(),
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::NOT_FOUND;
    *response.headers_mut() = out_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ETAG: &str = "\"abc123\"";
    const LAST_MODIFIED: &str = "Sat, 29 Oct 1994 19:43:31 GMT";

    #[test]
    fn security_baseline_is_complete() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers);

        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
        assert_eq!(
            headers.get("strict-transport-security").unwrap(),
            "max-age=86400"
        );
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-download-options").unwrap(), "noopen");
        assert_eq!(headers.get("x-frame-options").unwrap(), "SAMEORIGIN");
        assert_eq!(headers.get("x-xss-protection").unwrap(), "1; mode=block");
    }

    #[test]
    fn last_modified_is_valid_http_date() {
        let mut headers = HeaderMap::new();
        set_last_modified_now(&mut headers);
        let value = headers.get("last-modified").unwrap().to_str().unwrap();
        assert!(httpdate::parse_http_date(value).is_ok());
    }

    fn request_headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn no_range_header_means_no_blob_range() {
        let headers = request_headers(&[]);
        assert!(blob_range_header(&headers, ETAG, LAST_MODIFIED, false).is_none());
    }

    #[test]
    fn range_forwarded_on_immutable_origin() {
        let headers = request_headers(&[("range", "bytes=0-99")]);
        let value = blob_range_header(&headers, ETAG, LAST_MODIFIED, false).unwrap();
        assert_eq!(value, "bytes=0-99");
    }

    #[test]
    fn range_suppressed_on_mutable_origin() {
        let headers = request_headers(&[("range", "bytes=0-99")]);
        let value = blob_range_header(&headers, ETAG, LAST_MODIFIED, true).unwrap();
        assert_eq!(value, "");
    }

    #[test]
    fn range_suppressed_when_if_range_mismatches() {
        let headers = request_headers(&[("range", "bytes=0-99"), ("if-range", "\"other\"")]);
        let value = blob_range_header(&headers, ETAG, LAST_MODIFIED, false).unwrap();
        assert_eq!(value, "");
    }

    #[test]
    fn range_kept_when_if_range_matches_etag() {
        let headers = request_headers(&[("range", "bytes=0-99"), ("if-range", ETAG)]);
        let value = blob_range_header(&headers, ETAG, LAST_MODIFIED, false).unwrap();
        assert_eq!(value, "bytes=0-99");
    }

    #[test]
    fn range_kept_when_if_range_matches_last_modified() {
        let headers = request_headers(&[("range", "bytes=0-99"), ("if-range", LAST_MODIFIED)]);
        let value = blob_range_header(&headers, ETAG, LAST_MODIFIED, false).unwrap();
        assert_eq!(value, "bytes=0-99");
    }

    #[test]
    fn send_blob_sets_key_and_range() {
        let req = request_headers(&[("range", "bytes=0-99")]);
        let response = send_blob(
            &GsPathDelegate,
            "site.example.com",
            "/index.html",
            &req,
            ETAG,
            LAST_MODIFIED,
            true,
            HeaderMap::new(),
        )
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-appengine-blobkey").unwrap(),
            "/gs/site.example.com/index.html"
        );
        // Mutable origin: the range is present but suppressed
        assert_eq!(response.headers().get("x-appengine-blobrange").unwrap(), "");
    }

    #[test]
    fn send_blob_without_range_sets_only_key() {
        let response = send_blob(
            &GsPathDelegate,
            "site.example.com",
            "/index.html",
            &HeaderMap::new(),
            ETAG,
            LAST_MODIFIED,
            true,
            HeaderMap::new(),
        )
        .unwrap();

        assert!(response.headers().get("x-appengine-blobkey").is_some());
        assert!(response.headers().get("x-appengine-blobrange").is_none());
    }
}
