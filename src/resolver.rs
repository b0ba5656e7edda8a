//! Object Resolver Module
//!
//! Maps a request path to the stored object that should answer it. The
//! working object starts as the raw escaped path and is rebound by an
//! ordered fallback chain: main-page suffix for directory-like paths,
//! `.html` completion under clean URLs, then the bucket's rewrite rules.
//! The resolver issues at most four metadata probes per request and never
//! recurses.

use crate::firebase::SiteRules;
use crate::origin::{ObjectStore, OriginResponse};
use crate::website::WebsiteConfiguration;
use crate::Result;
use hyper::StatusCode;

/// The final working object and the origin response that vouches for it
pub struct ResolvedObject {
    pub object: String,
    pub response: OriginResponse,
}

/// Resolve the object to serve for `request_path`.
///
/// `initial_object` is the raw escaped request path, with the bare root
/// already rewritten to `/index.html` by the caller.
pub async fn resolve_object<S: ObjectStore>(
    store: &S,
    bucket: &str,
    website: &WebsiteConfiguration,
    rules: &SiteRules,
    request_path: &str,
    initial_object: &str,
) -> Result<ResolvedObject> {
    let main_page_suffix = format!("/{}", website.main_page_suffix);
    let not_found_page = format!("/{}", website.not_found_page);

    let mut object = initial_object.to_string();

    // The bare root collapses to the bucket's main page
    if object.len() <= 1 {
        object = main_page_suffix.clone();
    }

    // An empty main-page suffix or a direct hit on the not-found page
    // cannot be served as-is; only a rewrite can still answer
    if object.len() <= 1 || object == not_found_page {
        return rewrite_or_not_found(store, bucket, rules, request_path, object).await;
    }

    if rules.trailing_slash.is_set() {
        let trimmed = object.trim_end_matches('/');
        if trimmed.is_empty() {
            // All-slash paths cannot name an object
            return rewrite_or_not_found(store, bucket, rules, request_path, object).await;
        }
        object = trimmed.to_string();
    }

    let primary = store.head_object(bucket, &object).await?;

    // A 404, or a trailing-slash path backed by a zero-length directory
    // placeholder, triggers the fallback chain
    let directory_like = primary.status == StatusCode::NOT_FOUND
        || (object.ends_with('/') && primary.stored_length_is_zero());

    if directory_like {
        let base = object.trim_end_matches('/').to_string();
        let mut candidates = vec![format!("{}{}", base, main_page_suffix)];
        if rules.clean_urls {
            candidates.push(format!("{}.html", base));
        }
        if let Some(rewrite) = rules.process_rewrites(request_path) {
            candidates.push(rewrite);
        }

        for candidate in candidates {
            if let Some(response) = probe(store, bucket, &mut object, &candidate).await? {
                return Ok(ResolvedObject { object, response });
            }
        }
    }

    Ok(ResolvedObject {
        object,
        response: primary,
    })
}

async fn rewrite_or_not_found<S: ObjectStore>(
    store: &S,
    bucket: &str,
    rules: &SiteRules,
    request_path: &str,
    mut object: String,
) -> Result<ResolvedObject> {
    if let Some(rewrite) = rules.process_rewrites(request_path) {
        if let Some(response) = probe(store, bucket, &mut object, &rewrite).await? {
            return Ok(ResolvedObject { object, response });
        }
    }
    Ok(ResolvedObject {
        object,
        response: OriginResponse::status_only(StatusCode::NOT_FOUND),
    })
}

/// Probe one fallback candidate. The candidate is accepted only if it is a
/// plausible object path that differs from the current working object and
/// the origin answers anything but 404.
async fn probe<S: ObjectStore>(
    store: &S,
    bucket: &str,
    object: &mut String,
    candidate: &str,
) -> Result<Option<OriginResponse>> {
    if candidate.len() > 1 && candidate.starts_with('/') && candidate != object {
        let response = store.head_object(bucket, candidate).await?;
        if response.status != StatusCode::NOT_FOUND {
            *object = candidate.to_string();
            return Ok(Some(response));
        }
    }
    Ok(None)
}
