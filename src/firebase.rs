//! Firebase Rules Module
//!
//! Loads the per-bucket hosting rules file (`firebase.json`) at startup and
//! compiles it into immutable [`SiteRules`] values: redirect, rewrite and
//! header-injection matchers plus the `cleanUrls` and `trailingSlash` flags.
//! Rule sources are extended globs compiled by [`crate::extglob`].

use crate::extglob::{compile_ext_glob, compile_template};
use crate::{ProxyError, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, StatusCode};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Raw per-bucket rules as they appear in `firebase.json`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteConfig {
    pub redirects: Vec<RedirectRule>,
    pub rewrites: Vec<RewriteRule>,
    pub headers: Vec<HeaderRule>,
    pub clean_urls: bool,
    pub trailing_slash: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectRule {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type", default = "default_redirect_status")]
    pub status: u16,
}

fn default_redirect_status() -> u16 {
    301
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteRule {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderRule {
    pub source: String,
    pub headers: Vec<HeaderKv>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderKv {
    pub key: String,
    pub value: String,
}

/// Three-state trailing-slash policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrailingSlash {
    #[default]
    Unset,
    ForceOff,
    ForceOn,
}

impl TrailingSlash {
    pub fn from_option(value: Option<bool>) -> Self {
        match value {
            None => TrailingSlash::Unset,
            Some(false) => TrailingSlash::ForceOff,
            Some(true) => TrailingSlash::ForceOn,
        }
    }

    /// Whether the policy is configured at all (either direction)
    pub fn is_set(self) -> bool {
        self != TrailingSlash::Unset
    }
}

struct CompiledRedirect {
    pattern: Regex,
    template: String,
    status: StatusCode,
}

struct CompiledRewrite {
    pattern: Regex,
    destination: String,
}

struct CompiledHeaders {
    pattern: Regex,
    headers: Vec<(HeaderName, HeaderValue)>,
}

/// Compiled, immutable rules for one bucket
#[derive(Default)]
pub struct SiteRules {
    redirects: Vec<CompiledRedirect>,
    rewrites: Vec<CompiledRewrite>,
    headers: Vec<CompiledHeaders>,
    pub clean_urls: bool,
    pub trailing_slash: TrailingSlash,
}

impl SiteRules {
    pub fn compile(config: &SiteConfig) -> Result<Self> {
        let mut redirects = Vec::with_capacity(config.redirects.len());
        for rule in &config.redirects {
            let status = StatusCode::from_u16(rule.status).map_err(|_| {
                ProxyError::RulesError(format!(
                    "redirect {:?}: invalid status {}",
                    rule.source, rule.status
                ))
            })?;
            if !status.is_redirection() {
                return Err(ProxyError::RulesError(format!(
                    "redirect {:?}: status {} is not a redirect",
                    rule.source, rule.status
                )));
            }
            redirects.push(CompiledRedirect {
                pattern: compile_ext_glob(&rule.source)?,
                template: compile_template(&rule.destination),
                status,
            });
        }

        let mut rewrites = Vec::with_capacity(config.rewrites.len());
        for rule in &config.rewrites {
            rewrites.push(CompiledRewrite {
                pattern: compile_ext_glob(&rule.source)?,
                destination: rule.destination.clone(),
            });
        }

        let mut headers = Vec::with_capacity(config.headers.len());
        for rule in &config.headers {
            let mut pairs = Vec::with_capacity(rule.headers.len());
            for kv in &rule.headers {
                let name = HeaderName::from_bytes(kv.key.as_bytes()).map_err(|e| {
                    ProxyError::RulesError(format!("header rule {:?}: {}", kv.key, e))
                })?;
                let value = HeaderValue::from_str(&kv.value).map_err(|e| {
                    ProxyError::RulesError(format!("header rule {:?}: {}", kv.key, e))
                })?;
                pairs.push((name, value));
            }
            headers.push(CompiledHeaders {
                pattern: compile_ext_glob(&rule.source)?,
                headers: pairs,
            });
        }

        Ok(Self {
            redirects,
            rewrites,
            headers,
            clean_urls: config.clean_urls,
            trailing_slash: TrailingSlash::from_option(config.trailing_slash),
        })
    }

    /// First matching redirect rule, with captures expanded into the
    /// destination template.
    pub fn process_redirects(&self, path: &str) -> Option<(StatusCode, String)> {
        for rule in &self.redirects {
            if rule.pattern.is_match(path) {
                let location = rule
                    .pattern
                    .replace(path, rule.template.as_str())
                    .into_owned();
                return Some((rule.status, location));
            }
        }
        None
    }

    /// First matching rewrite rule's destination object path.
    pub fn process_rewrites(&self, path: &str) -> Option<String> {
        for rule in &self.rewrites {
            if rule.pattern.is_match(path) {
                return Some(rule.destination.clone());
            }
        }
        None
    }

    /// Inject the headers of every rule matching `path`.
    pub fn process_headers(&self, path: &str, out: &mut HeaderMap) {
        for rule in &self.headers {
            if rule.pattern.is_match(path) {
                for (name, value) in &rule.headers {
                    out.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

/// All per-bucket rules loaded at process start. Read-only afterwards.
pub struct FirebaseRules {
    sites: HashMap<String, Arc<SiteRules>>,
    empty: Arc<SiteRules>,
}

impl FirebaseRules {
    /// Load rules from `firebase.json`. A missing file yields an empty rule
    /// set; a malformed one is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let rules = Self::from_json_str(&contents)?;
                info!(
                    "Loaded hosting rules for {} bucket(s) from {}",
                    rules.sites.len(),
                    path.display()
                );
                Ok(rules)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No rules file at {}, serving without rules", path.display());
                Ok(Self::empty())
            }
            Err(e) => Err(ProxyError::IoError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Parse and compile a `bucket → SiteConfig` JSON document.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let raw: HashMap<String, SiteConfig> = serde_json::from_str(contents)?;
        let mut sites = HashMap::with_capacity(raw.len());
        for (bucket, config) in &raw {
            let compiled = SiteRules::compile(config).map_err(|e| {
                ProxyError::RulesError(format!("bucket {:?}: {}", bucket, e))
            })?;
            sites.insert(bucket.clone(), Arc::new(compiled));
        }
        Ok(Self {
            sites,
            empty: Arc::new(SiteRules::default()),
        })
    }

    pub fn empty() -> Self {
        Self {
            sites: HashMap::new(),
            empty: Arc::new(SiteRules::default()),
        }
    }

    /// Rules for a bucket; buckets without an entry get the empty rule set.
    pub fn site(&self, bucket: &str) -> Arc<SiteRules> {
        self.sites
            .get(bucket)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
