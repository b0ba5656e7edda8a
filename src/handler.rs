//! Request Handler Module
//!
//! Orchestrates one request through the serving pipeline: configured
//! redirects, website-config lookup, clean-URL canonicalization, object
//! resolution, precondition evaluation and body dispatch.

use crate::conditions::{check_conditions, ConditionOutcome};
use crate::dispatch::{
    apply_security_headers, copy_cache_control, copy_entity_headers, empty_body, send_blob,
    send_not_found, set_last_modified_now, stream_object, BlobDelegate, ProxyBody,
};
use crate::firebase::{FirebaseRules, SiteRules, TrailingSlash};
use crate::origin::ObjectStore;
use crate::resolver::resolve_object;
use crate::website::{WebsiteCatalog, WebsiteConfiguration};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Method, Response, StatusCode, Uri};
use tracing::error;

/// Minimal handler result for responses with no dispatcher-written body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResult {
    pub status: u16,
    pub location: Option<String>,
    pub message: Option<String>,
}

impl HttpResult {
    pub fn status(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            ..Default::default()
        }
    }

    pub fn redirect(status: StatusCode, location: String) -> Self {
        Self {
            status: status.as_u16(),
            location: Some(location),
            message: None,
        }
    }

    pub fn with_message(status: StatusCode, message: String) -> Self {
        Self {
            status: status.as_u16(),
            location: None,
            message: Some(message),
        }
    }
}

/// What the handler produced: either a short status-only result for the
/// server to render, or a complete response the dispatcher already built.
pub enum HandlerReply {
    Short(HttpResult),
    Full(Response<ProxyBody>),
}

fn short(status: StatusCode) -> HandlerReply {
    HandlerReply::Short(HttpResult::status(status))
}

/// Serve one GET or HEAD request for `bucket`.
pub async fn serve_website<S: ObjectStore>(
    parts: &Parts,
    bucket: &str,
    store: &S,
    catalog: &WebsiteCatalog,
    rules: &FirebaseRules,
    blob_delegate: Option<&dyn BlobDelegate>,
) -> HandlerReply {
    let path = parts.uri.path();
    let query = query_suffix(&parts.uri);
    let site = rules.site(bucket);

    // Configured redirects run before anything else
    if let Some((status, location)) = site.process_redirects(path) {
        return HandlerReply::Short(HttpResult::redirect(
            status,
            format!("{}{}", location, query),
        ));
    }

    let website = match catalog.ensure(bucket, store).await {
        Ok(website) => website,
        Err(e) => {
            error!(bucket, error = %e, "Failed to load website configuration");
            return short(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if let Some(canonical) = clean_url(path, &website, &site) {
        return HandlerReply::Short(HttpResult::redirect(
            StatusCode::MOVED_PERMANENTLY,
            format!("{}{}", canonical, query),
        ));
    }

    // The raw escaped path is the initial working object; the bare root
    // maps to /index.html before the resolver runs
    let initial_object = if path == "/" { "/index.html" } else { path };

    let resolved =
        match resolve_object(store, bucket, &website, &site, path, initial_object).await {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(bucket, path, error = %e, "Object resolution failed");
                return short(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

    if resolved.response.status == StatusCode::NOT_FOUND {
        if website.not_found_page.is_empty() {
            return short(StatusCode::NOT_FOUND);
        }
        return match send_not_found(store, bucket, &website, &site, parts.method == Method::HEAD)
            .await
        {
            Ok(response) => HandlerReply::Full(response),
            Err(_) => short(StatusCode::INTERNAL_SERVER_ERROR),
        };
    }
    if resolved.response.status != StatusCode::OK {
        let reason = resolved
            .response
            .status
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        return HandlerReply::Short(HttpResult::with_message(resolved.response.status, reason));
    }

    let etag = resolved.response.header_str("etag").to_string();
    let last_modified = resolved.response.header_str("last-modified").to_string();

    match check_conditions(&parts.headers, &etag, &last_modified, true) {
        Ok(ConditionOutcome::Proceed) => {}
        Ok(ConditionOutcome::NotModified) => {
            let mut response = Response::new(empty_body());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            copy_cache_control(&resolved.response.headers, response.headers_mut());
            return HandlerReply::Full(response);
        }
        Ok(ConditionOutcome::PreconditionFailed) => {
            return short(StatusCode::PRECONDITION_FAILED);
        }
        Err(e) => {
            error!(bucket, object = %resolved.object, error = %e, "Conditional evaluation failed");
            return short(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let mut out_headers = HeaderMap::new();
    copy_cache_control(&resolved.response.headers, &mut out_headers);
    copy_entity_headers(&resolved.response.headers, &mut out_headers);
    set_last_modified_now(&mut out_headers);
    apply_security_headers(&mut out_headers);
    site.process_headers(path, &mut out_headers);

    // Identity-encoded bytes can be served verbatim by the fronting
    // runtime; anything else (e.g. gzip) must be streamed here
    if resolved.response.stored_content_encoding() == "identity" {
        if let Some(delegate) = blob_delegate {
            return match send_blob(
                delegate,
                bucket,
                &resolved.object,
                &parts.headers,
                &etag,
                &last_modified,
                true,
                out_headers,
            ) {
                Ok(response) => HandlerReply::Full(response),
                Err(_) => short(StatusCode::INTERNAL_SERVER_ERROR),
            };
        }
    }

    match stream_object(
        store,
        bucket,
        &resolved.object,
        parts.method == Method::HEAD,
        out_headers,
    )
    .await
    {
        Ok(response) => HandlerReply::Full(response),
        Err(_) => short(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Canonical form of `path` under the bucket's clean-URL and
/// trailing-slash policies, or `None` when the path is already canonical.
pub fn clean_url(
    path: &str,
    website: &WebsiteConfiguration,
    rules: &SiteRules,
) -> Option<String> {
    let mut canonical = path.to_string();

    if rules.clean_urls {
        if !website.main_page_suffix.is_empty() {
            if let Some(stripped) = canonical.strip_suffix(&website.main_page_suffix) {
                canonical = stripped.to_string();
            }
        }
        if let Some(stripped) = canonical.strip_suffix(".html") {
            canonical = stripped.to_string();
        }
    }

    if rules.trailing_slash.is_set() {
        canonical = canonical.trim_end_matches('/').to_string();
        if rules.trailing_slash == TrailingSlash::ForceOn {
            canonical.push('/');
        }
    }

    // The bucket root has no canonical alternative
    if canonical.is_empty() || canonical == path {
        None
    } else {
        Some(canonical)
    }
}

fn query_suffix(uri: &Uri) -> String {
    match uri.query() {
        Some(query) if !query.is_empty() => format!("?{}", query),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::GsPathDelegate;
    use crate::origin::OriginResponse;
    use crate::Result;
    use hyper::header::{HeaderName, HeaderValue};
    use hyper::Request;
    use std::collections::HashMap;

    const ETAG: &str = "\"abc123\"";
    const LAST_MODIFIED: &str = "Sat, 29 Oct 1994 19:43:31 GMT";

    struct StubObject {
        status: StatusCode,
        headers: Vec<(&'static str, String)>,
    }

    struct StubStore {
        website: WebsiteConfiguration,
        objects: HashMap<String, StubObject>,
    }

    impl StubStore {
        fn response_for(&self, object: &str) -> OriginResponse {
            match self.objects.get(object) {
                Some(stub) => {
                    let mut headers = HeaderMap::new();
                    for (name, value) in &stub.headers {
                        headers.insert(
                            HeaderName::from_bytes(name.as_bytes()).unwrap(),
                            HeaderValue::from_str(value).unwrap(),
                        );
                    }
                    OriginResponse {
                        status: stub.status,
                        headers,
                        body: None,
                    }
                }
                None => OriginResponse::status_only(StatusCode::NOT_FOUND),
            }
        }
    }

    impl ObjectStore for StubStore {
        async fn head_object(&self, _bucket: &str, object: &str) -> Result<OriginResponse> {
            Ok(self.response_for(object))
        }

        async fn get_object(&self, _bucket: &str, object: &str) -> Result<OriginResponse> {
            Ok(self.response_for(object))
        }

        async fn get_bucket_website(&self, _bucket: &str) -> Result<WebsiteConfiguration> {
            Ok(self.website.clone())
        }
    }

    fn page(content_type: &str) -> StubObject {
        StubObject {
            status: StatusCode::OK,
            headers: vec![
                ("etag", ETAG.to_string()),
                ("last-modified", LAST_MODIFIED.to_string()),
                ("content-type", content_type.to_string()),
                ("cache-control", "public, max-age=60".to_string()),
                ("x-goog-stored-content-encoding", "identity".to_string()),
                ("x-goog-stored-content-length", "128".to_string()),
            ],
        }
    }

    fn store(objects: Vec<(&str, StubObject)>) -> StubStore {
        StubStore {
            website: WebsiteConfiguration {
                main_page_suffix: "index.html".to_string(),
                not_found_page: String::new(),
            },
            objects: objects
                .into_iter()
                .map(|(path, stub)| (path.to_string(), stub))
                .collect(),
        }
    }

    fn parts(uri: &str, method: Method, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _body) = builder.body(()).unwrap().into_parts();
        parts
    }

    async fn run(
        store: &StubStore,
        rules: &FirebaseRules,
        parts: &Parts,
        delegate: Option<&dyn BlobDelegate>,
    ) -> HandlerReply {
        let catalog = WebsiteCatalog::new();
        serve_website(parts, "site.example.com", store, &catalog, rules, delegate).await
    }

    #[tokio::test]
    async fn redirect_rule_short_circuits() {
        let store = store(vec![]);
        let rules = FirebaseRules::from_json_str(
            r#"{"site.example.com": {"redirects": [
                {"source": "/old", "destination": "/new", "type": 302}
            ]}}"#,
        )
        .unwrap();
        let parts = parts("/old?a=1", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => {
                assert_eq!(result.status, 302);
                assert_eq!(result.location.as_deref(), Some("/new?a=1"));
            }
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn clean_url_redirect_preserves_query() {
        let store = store(vec![]);
        let rules = FirebaseRules::from_json_str(
            r#"{"site.example.com": {"cleanUrls": true}}"#,
        )
        .unwrap();
        let parts = parts("/about.html?tab=2", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => {
                assert_eq!(result.status, 301);
                assert_eq!(result.location.as_deref(), Some("/about?tab=2"));
            }
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn ok_response_carries_baseline_headers() {
        let store = store(vec![("/index.html", page("text/html"))]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Full(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
                assert_eq!(
                    response.headers().get("cache-control").unwrap(),
                    "public, max-age=60"
                );
                assert_eq!(
                    response.headers().get("x-content-type-options").unwrap(),
                    "nosniff"
                );
                let last_modified = response
                    .headers()
                    .get("last-modified")
                    .unwrap()
                    .to_str()
                    .unwrap();
                // Last-Modified is the serving time, not the origin's value
                assert_ne!(last_modified, LAST_MODIFIED);
                assert!(httpdate::parse_http_date(last_modified).is_ok());
            }
            HandlerReply::Short(result) => panic!("expected full reply, got {:?}", result),
        }
    }

    #[tokio::test]
    async fn matching_if_none_match_yields_304_with_cache_control() {
        let store = store(vec![("/index.html", page("text/html"))]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[("if-none-match", ETAG)]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Full(response) => {
                assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
                assert_eq!(
                    response.headers().get("cache-control").unwrap(),
                    "public, max-age=60"
                );
            }
            HandlerReply::Short(result) => panic!("expected full reply, got {:?}", result),
        }
    }

    #[tokio::test]
    async fn failed_if_match_yields_412() {
        let store = store(vec![("/index.html", page("text/html"))]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[("if-match", "\"other\"")]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => assert_eq!(result.status, 412),
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn malformed_origin_etag_yields_500() {
        let store = store(vec![(
            "/index.html",
            StubObject {
                status: StatusCode::OK,
                headers: vec![
                    ("etag", "unquoted".to_string()),
                    ("last-modified", LAST_MODIFIED.to_string()),
                ],
            },
        )]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => assert_eq!(result.status, 500),
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn not_found_without_configured_page_is_bare_404() {
        let store = store(vec![]);
        let rules = FirebaseRules::empty();
        let parts = parts("/missing", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => {
                assert_eq!(result.status, 404);
                assert!(result.message.is_none());
            }
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn not_found_with_configured_page_serves_its_body() {
        let mut store = store(vec![("/404.html", page("text/html"))]);
        store.website.not_found_page = "404.html".to_string();
        let rules = FirebaseRules::empty();
        let parts = parts("/missing", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Full(response) => {
                assert_eq!(response.status(), StatusCode::NOT_FOUND);
                assert_eq!(response.headers().get("content-type").unwrap(), "text/html");
                assert_eq!(
                    response.headers().get("x-frame-options").unwrap(),
                    "SAMEORIGIN"
                );
            }
            HandlerReply::Short(result) => panic!("expected full reply, got {:?}", result),
        }
    }

    #[tokio::test]
    async fn broken_not_found_page_is_a_500() {
        let mut store = store(vec![]);
        store.website.not_found_page = "404.html".to_string();
        let rules = FirebaseRules::empty();
        let parts = parts("/missing", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => assert_eq!(result.status, 500),
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn origin_error_status_passes_through_with_reason() {
        let store = store(vec![(
            "/index.html",
            StubObject {
                status: StatusCode::FORBIDDEN,
                headers: vec![],
            },
        )]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[]);

        match run(&store, &rules, &parts, None).await {
            HandlerReply::Short(result) => {
                assert_eq!(result.status, 403);
                assert_eq!(result.message.as_deref(), Some("Forbidden"));
            }
            HandlerReply::Full(_) => panic!("expected short reply"),
        }
    }

    #[tokio::test]
    async fn identity_encoding_delegates_to_blob_handle() {
        let store = store(vec![("/index.html", page("text/html"))]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[("range", "bytes=0-10")]);

        match run(&store, &rules, &parts, Some(&GsPathDelegate)).await {
            HandlerReply::Full(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                assert_eq!(
                    response.headers().get("x-appengine-blobkey").unwrap(),
                    "/gs/site.example.com/index.html"
                );
                // Mutable origin suppresses the forwarded range
                assert_eq!(
                    response.headers().get("x-appengine-blobrange").unwrap(),
                    ""
                );
            }
            HandlerReply::Short(result) => panic!("expected full reply, got {:?}", result),
        }
    }

    #[tokio::test]
    async fn non_identity_encoding_streams_instead_of_delegating() {
        let store = store(vec![(
            "/index.html",
            StubObject {
                status: StatusCode::OK,
                headers: vec![
                    ("etag", ETAG.to_string()),
                    ("last-modified", LAST_MODIFIED.to_string()),
                    ("x-goog-stored-content-encoding", "gzip".to_string()),
                ],
            },
        )]);
        let rules = FirebaseRules::empty();
        let parts = parts("/", Method::GET, &[]);

        match run(&store, &rules, &parts, Some(&GsPathDelegate)).await {
            HandlerReply::Full(response) => {
                assert_eq!(response.status(), StatusCode::OK);
                assert!(response.headers().get("x-appengine-blobkey").is_none());
            }
            HandlerReply::Short(result) => panic!("expected full reply, got {:?}", result),
        }
    }

    #[test]
    fn clean_url_strips_suffixes() {
        let website = WebsiteConfiguration {
            main_page_suffix: "index.html".to_string(),
            not_found_page: String::new(),
        };
        let rules = FirebaseRules::from_json_str(r#"{"b": {"cleanUrls": true}}"#)
            .unwrap()
            .site("b");

        assert_eq!(
            clean_url("/about.html", &website, &rules).as_deref(),
            Some("/about")
        );
        assert_eq!(
            clean_url("/docs/index.html", &website, &rules).as_deref(),
            Some("/docs/")
        );
        assert_eq!(clean_url("/about", &website, &rules), None);
        assert_eq!(clean_url("/", &website, &rules), None);
    }

    #[test]
    fn clean_url_is_idempotent() {
        let website = WebsiteConfiguration {
            main_page_suffix: "index.html".to_string(),
            not_found_page: String::new(),
        };
        let rules = FirebaseRules::from_json_str(r#"{"b": {"cleanUrls": true}}"#)
            .unwrap()
            .site("b");

        let canonical = clean_url("/about.html", &website, &rules).unwrap();
        assert_eq!(clean_url(&canonical, &website, &rules), None);
    }

    #[test]
    fn trailing_slash_force_on() {
        let website = WebsiteConfiguration::default();
        let rules = FirebaseRules::from_json_str(r#"{"b": {"trailingSlash": true}}"#)
            .unwrap()
            .site("b");

        assert_eq!(clean_url("/blog", &website, &rules).as_deref(), Some("/blog/"));
        assert_eq!(clean_url("/blog/", &website, &rules), None);
        assert_eq!(
            clean_url("/blog///", &website, &rules).as_deref(),
            Some("/blog/")
        );
    }

    #[test]
    fn trailing_slash_force_off() {
        let website = WebsiteConfiguration::default();
        let rules = FirebaseRules::from_json_str(r#"{"b": {"trailingSlash": false}}"#)
            .unwrap()
            .site("b");

        assert_eq!(clean_url("/blog/", &website, &rules).as_deref(), Some("/blog"));
        assert_eq!(clean_url("/blog", &website, &rules), None);
        // The root is left alone even under force-off
        assert_eq!(clean_url("/", &website, &rules), None);
    }

    #[test]
    fn trailing_slash_canonicalization_is_a_fixed_point() {
        let website = WebsiteConfiguration::default();
        let rules = FirebaseRules::from_json_str(r#"{"b": {"trailingSlash": true}}"#)
            .unwrap()
            .site("b");

        let canonical = clean_url("/blog", &website, &rules).unwrap();
        assert_eq!(clean_url(&canonical, &website, &rules), None);
    }
}
