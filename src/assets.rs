//! Versioned cache of static build assets.
//!
//! Mirrors the install/activate/fetch lifecycle of the web client's offline
//! support: `install` populates one cache namespace per build version,
//! `activate` drops every namespace from earlier builds, and `serve` answers
//! only for paths on the known asset list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to fetch asset {path}: {reason}")]
    Fetch { path: String, reason: anyhow::Error },
}

/// The full list of build outputs plus the build version, supplied by the
/// build system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetManifest {
    pub version: String,
    pub assets: Vec<String>,
}

impl AssetManifest {
    pub fn new(version: impl Into<String>, assets: Vec<String>) -> Self {
        Self {
            version: version.into(),
            assets,
        }
    }

    /// Cache namespace for this build.
    pub fn cache_key(&self) -> String {
        format!("cache-{}", self.version)
    }
}

/// Where asset bytes come from at install time.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(&self, path: &str) -> anyhow::Result<Vec<u8>>;
}

/// Fetches assets from the origin server over HTTP.
pub struct HttpAssetSource {
    http: reqwest::Client,
    origin: String,
}

impl HttpAssetSource {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            origin: origin.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn fetch(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let url = format!("{}{}", self.origin, path);
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Named-cache storage: a set of cache namespaces, each mapping asset paths
/// to their bytes. Shared between workers via `Arc`.
#[derive(Debug, Default)]
pub struct CacheStore {
    caches: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.caches.lock().await.keys().cloned().collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.caches.lock().await.contains_key(key)
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.caches.lock().await.remove(key).is_some()
    }

    pub async fn put_all(&self, key: &str, entries: HashMap<String, Vec<u8>>) {
        self.caches
            .lock()
            .await
            .entry(key.to_string())
            .or_default()
            .extend(entries);
    }

    pub async fn lookup(&self, key: &str, path: &str) -> Option<Vec<u8>> {
        self.caches.lock().await.get(key)?.get(path).cloned()
    }
}

/// Keeps one build's assets available offline.
pub struct AssetCacheWorker {
    cache_key: String,
    assets: Vec<String>,
    store: Arc<CacheStore>,
}

impl AssetCacheWorker {
    pub fn new(manifest: AssetManifest, store: Arc<CacheStore>) -> Self {
        Self {
            cache_key: manifest.cache_key(),
            assets: manifest.assets,
            store,
        }
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Fetch every known asset and populate this build's cache namespace.
    /// Installation completes only once population has succeeded; if any
    /// fetch fails, nothing is written.
    pub async fn install(&self, source: &dyn AssetSource) -> Result<(), CacheError> {
        info!("installing (caching application assets)");
        let mut entries = HashMap::new();
        for path in &self.assets {
            let bytes = source
                .fetch(path)
                .await
                .map_err(|reason| CacheError::Fetch {
                    path: path.clone(),
                    reason,
                })?;
            entries.insert(path.clone(), bytes);
        }
        self.store.put_all(&self.cache_key, entries).await;
        Ok(())
    }

    /// Drop every cache namespace left over from earlier builds, so at most
    /// one version's assets stay on disk.
    pub async fn activate(&self) {
        info!("activating");
        for key in self.store.keys().await {
            if key != self.cache_key {
                info!("deleting old cache: {key}");
                self.store.delete(&key).await;
            }
        }
    }

    /// Serve a request path from cache. Paths missing from the known asset
    /// list are not answered and fall through to normal network handling.
    /// Lookups never populate entries; the cache is written at install only.
    pub async fn serve(&self, path: &str) -> Option<Vec<u8>> {
        if !self.assets.iter().any(|asset| asset == path) {
            return None;
        }
        let bytes = self.store.lookup(&self.cache_key, path).await;
        if bytes.is_some() {
            debug!("serving {path} directly");
        }
        bytes
    }
}
