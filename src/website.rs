//! Website Configuration Module
//!
//! Per-bucket static-website configuration (`MainPageSuffix`,
//! `NotFoundPage`) read from the origin's `?websiteConfig` XML document,
//! and the process-wide catalog that caches it. Entries are created on the
//! first request for a bucket and never evicted or mutated afterwards;
//! concurrent first-misses are collapsed to one origin fetch per bucket.

use crate::origin::ObjectStore;
use crate::{ProxyError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// A bucket's website configuration. Both fields are stored without a
/// leading slash; a slash is prepended on use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebsiteConfiguration {
    pub main_page_suffix: String,
    pub not_found_page: String,
}

/// Parse the origin's `?websiteConfig` XML document.
pub fn parse_website_config(xml: &str) -> Result<WebsiteConfiguration> {
    let mut reader = Reader::from_str(xml);
    let mut config = WebsiteConfiguration::default();
    let mut current: Option<Field> = None;

    #[derive(Clone, Copy)]
    enum Field {
        MainPageSuffix,
        NotFoundPage,
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                current = match e.name().as_ref() {
                    b"MainPageSuffix" => Some(Field::MainPageSuffix),
                    b"NotFoundPage" => Some(Field::NotFoundPage),
                    _ => None,
                };
            }
            Ok(Event::Text(t)) => {
                if let Some(field) = current {
                    let text = t
                        .unescape()
                        .map_err(|e| ProxyError::XmlError(e.to_string()))?;
                    let value = text.trim().to_string();
                    match field {
                        Field::MainPageSuffix => config.main_page_suffix = value,
                        Field::NotFoundPage => config.not_found_page = value,
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProxyError::XmlError(e.to_string())),
            Ok(_) => {}
        }
    }

    Ok(config)
}

/// Process-wide `bucket → WebsiteConfiguration` catalog.
///
/// Insertion is monotonic: once a bucket resolves, later requests read the
/// cached value and never re-fetch. A per-bucket pending lock collapses
/// concurrent first-misses into a single `?websiteConfig` fetch.
pub struct WebsiteCatalog {
    entries: RwLock<HashMap<String, WebsiteConfiguration>>,
    pending: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WebsiteCatalog {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The cached configuration for a bucket, if it has resolved.
    pub async fn get(&self, bucket: &str) -> Option<WebsiteConfiguration> {
        self.entries.read().await.get(bucket).cloned()
    }

    /// The bucket's configuration, fetching it from the origin on first use.
    pub async fn ensure<S: ObjectStore>(
        &self,
        bucket: &str,
        store: &S,
    ) -> Result<WebsiteConfiguration> {
        if let Some(config) = self.get(bucket).await {
            return Ok(config);
        }

        // One fetch per bucket at a time
        let lock = {
            let mut pending = self.pending.lock().await;
            pending
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another task may have resolved the bucket while we waited
        if let Some(config) = self.get(bucket).await {
            return Ok(config);
        }

        let config = store.get_bucket_website(bucket).await?;
        info!(
            bucket = bucket,
            main_page_suffix = %config.main_page_suffix,
            not_found_page = %config.not_found_page,
            "Resolved website configuration"
        );
        self.entries
            .write()
            .await
            .insert(bucket.to_string(), config.clone());
        Ok(config)
    }
}

impl Default for WebsiteCatalog {
    fn default() -> Self {
        Self::new()
    }
}
