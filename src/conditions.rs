//! Conditional Request Module
//!
//! Evaluates the RFC 7232 preconditions this proxy honors — `If-Match`,
//! `If-Unmodified-Since`, `If-None-Match`, `If-Modified-Since` — against
//! the origin's validators. The `mutable` flag marks an origin whose bytes
//! may change under a stable identifier: positive matches can no longer be
//! trusted there, so `If-Match` passes only on `*` and
//! `If-Unmodified-Since` always fails. Negative (cache-hit) answers remain
//! safe.
//!
//! The evaluator is strict about its inputs: a missing or unquoted ETag or
//! an unparseable `Last-Modified` is an origin contract violation, not a
//! client error.

use crate::{ProxyError, Result};
use hyper::header;
use hyper::HeaderMap;
use std::time::SystemTime;

/// Outcome of precondition evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// No precondition blocked the request
    Proceed,
    /// Respond `304 Not Modified`
    NotModified,
    /// Respond `412 Precondition Failed`
    PreconditionFailed,
}

/// Evaluate request preconditions against the origin's `ETag` and
/// `Last-Modified` validators.
pub fn check_conditions(
    headers: &HeaderMap,
    etag: &str,
    last_modified: &str,
    mutable: bool,
) -> Result<ConditionOutcome> {
    let modified = httpdate::parse_http_date(last_modified).map_err(|e| {
        ProxyError::OriginContract(format!("invalid Last-Modified {:?}: {}", last_modified, e))
    })?;
    if etag.is_empty() || !etag.starts_with('"') {
        return Err(ProxyError::OriginContract(format!(
            "invalid ETag {:?}",
            etag
        )));
    }

    if headers.contains_key(header::IF_MATCH) {
        let mut matched = false;
        for matcher in matchers(headers, header::IF_MATCH) {
            // Positive entity matches cannot be trusted on a mutable origin
            if matcher == "*" || (!mutable && strong_compare(&matcher, etag)) {
                matched = true;
                break;
            }
        }
        if !matched {
            return Ok(ConditionOutcome::PreconditionFailed);
        }
    } else if let Some(since) = parse_date_header(headers, header::IF_UNMODIFIED_SINCE) {
        if modified > since || mutable {
            return Ok(ConditionOutcome::PreconditionFailed);
        }
    }

    if headers.contains_key(header::IF_NONE_MATCH) {
        for matcher in matchers(headers, header::IF_NONE_MATCH) {
            if matcher == "*" || weak_compare(&matcher, etag) {
                return Ok(ConditionOutcome::NotModified);
            }
        }
    } else if let Some(since) = parse_date_header(headers, header::IF_MODIFIED_SINCE) {
        if modified <= since {
            return Ok(ConditionOutcome::NotModified);
        }
    }

    Ok(ConditionOutcome::Proceed)
}

/// Entity tags from every line of a (possibly repeated) list header
fn matchers(headers: &HeaderMap, name: header::HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|line| line.split(','))
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

fn parse_date_header(headers: &HeaderMap, name: header::HeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
}

/// Strong comparison per RFC 7232 §2.3.2: weak tags never match
fn strong_compare(matcher: &str, etag: &str) -> bool {
    !matcher.starts_with("W/") && matcher == etag
}

/// Weak comparison: the `W/` prefix is ignored on both sides
fn weak_compare(matcher: &str, etag: &str) -> bool {
    strip_weak(matcher) == strip_weak(etag)
}

fn strip_weak(tag: &str) -> &str {
    tag.strip_prefix("W/").unwrap_or(tag)
}
