//! The offline cache manager: install, activate, and fetch handlers.
//!
//! One instance per deployed version. Collaborators are injected so the
//! handlers run the same against a browser-like host, a test host, or a
//! plain tokio runtime. Each handler's future must be driven to completion
//! before the host tears the phase down.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use pwacache_net::{Fetcher, Request, Response};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::CacheConfig;
use crate::storage::{CacheEntry, CacheStorage};
use crate::ServiceWorkerError;

/// Where a fetch answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Answer to an intercepted request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub version: String,
    /// Manifest entries stored.
    pub cached: usize,
}

/// Outcome of an activation. Deletion is best-effort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
    pub version: String,
    pub deleted: Vec<String>,
    /// Stale buckets that could not be deleted, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Cache-first offline shim for one version tag.
pub struct OfflineCacheManager {
    config: CacheConfig,
    manifest: Vec<Url>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl std::fmt::Debug for OfflineCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCacheManager")
            .field("version", &self.config.version)
            .field("manifest", &self.manifest.len())
            .finish_non_exhaustive()
    }
}

impl OfflineCacheManager {
    /// Create a manager. The manifest is resolved and validated up front.
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let manifest = config.manifest_urls()?;
        Ok(Self {
            config,
            manifest,
            storage,
            fetcher,
        })
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Resolved manifest URLs, in manifest order.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    /// Install: open the version bucket and precache every manifest asset.
    ///
    /// Assets are fetched concurrently. If any fetch fails or answers with a
    /// non-2xx status, nothing is written and the first failure is returned.
    /// Existing buckets are never touched.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn on_install(&self) -> Result<InstallReport, ServiceWorkerError> {
        let bucket = self.storage.open(&self.config.version).await?;
        info!(assets = self.manifest.len(), "Precaching manifest");

        let entries = try_join_all(self.manifest.iter().cloned().map(|url| self.precache(url)))
            .await
            .inspect_err(|e| warn!(error = %e, "Install failed"))?;

        let cached = entries.len();
        bucket.put_all(entries).await?;

        info!(cached, "Install complete");
        Ok(InstallReport {
            version: self.config.version.clone(),
            cached,
        })
    }

    async fn precache(&self, url: Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self
            .fetcher
            .fetch(request.clone())
            .await
            .map_err(|source| ServiceWorkerError::InstallAssetFetch {
                url: url.clone(),
                source,
            })?;

        if !response.ok() {
            return Err(ServiceWorkerError::InstallAssetStatus {
                url,
                status: response.status,
            });
        }

        debug!(url = %url, bytes = response.body.len(), "Fetched manifest asset");
        Ok(CacheEntry::from_response(&request, &response))
    }

    /// Activate: delete every bucket whose name is not the current version.
    ///
    /// Deletions run concurrently. One failing deletion is logged and
    /// recorded; it does not stop the others or fail the activation.
    #[instrument(skip(self), fields(version = %self.config.version))]
    pub async fn on_activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| *name != self.config.version)
            .collect();

        let results = join_all(stale.into_iter().map(|name| async move {
            let result = self.storage.delete(&name).await;
            (name, result)
        }))
        .await;

        let mut report = ActivateReport {
            version: self.config.version.clone(),
            ..Default::default()
        };
        for (name, result) in results {
            match result {
                Ok(true) => report.deleted.push(name),
                Ok(false) => debug!(bucket = %name, "Stale bucket already gone"),
                Err(e) => {
                    warn!(bucket = %name, error = %e, "Failed to delete stale bucket");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Activate complete"
        );
        Ok(report)
    }

    /// Fetch: serve from the version bucket, else pass through to the network.
    ///
    /// Network responses are returned unmodified and never stored. A network
    /// failure is returned as [`ServiceWorkerError::Network`] without any
    /// substitute response.
    pub async fn on_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        if let Some(bucket) = self.storage.get(&self.config.version).await? {
            if let Some(entry) = bucket.match_request(&request).await? {
                debug!(url = %request.url, method = %request.method, "Cache hit");
                return Ok(FetchResponse {
                    response: entry.to_response()?,
                    source: ResponseSource::Cache,
                });
            }
        }

        debug!(url = %request.url, method = %request.method, "Cache miss");
        self.fetch_from_network(request).await
    }

    /// Live network fetch with no cache involvement.
    pub async fn fetch_from_network(
        &self,
        request: Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(ServiceWorkerError::Network)?;
        Ok(FetchResponse {
            response,
            source: ResponseSource::Network,
        })
    }
}
