//! Compiled-in cache configuration.

use std::time::Duration;

use hashbrown::HashSet;
use pwacache_common::RetryConfig;
use url::Url;

use crate::ServiceWorkerError;

/// Version tag of the current cache bucket. Bump it to invalidate every
/// previously cached asset.
pub const CACHE_VERSION: &str = "my-pwa-cache-v3";

/// Assets precached at install, relative to the app origin.
pub const PRECACHE_MANIFEST: &[&str] = &["/", "/index.html", "/bg.webp", "/bg_mobile.webp"];

/// What to cache and under which bucket name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Bucket name for this deployment.
    pub version: String,
    /// Origin manifest paths are resolved against.
    pub origin: Url,
    /// Manifest entries, in order.
    pub manifest: Vec<String>,
}

impl CacheConfig {
    /// The compiled-in version tag and manifest, served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self::new(CACHE_VERSION, origin, PRECACHE_MANIFEST.iter().copied())
    }

    pub fn new<I, S>(version: impl Into<String>, origin: Url, manifest: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: version.into(),
            origin,
            manifest: manifest.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve the manifest against the origin.
    ///
    /// Fails on an empty version tag, an entry that does not resolve, or two
    /// entries resolving to the same URL.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "version tag must not be empty".to_string(),
            ));
        }
        if self.origin.cannot_be_a_base() {
            return Err(ServiceWorkerError::Config(format!(
                "origin {} cannot resolve relative paths",
                self.origin
            )));
        }

        let mut seen = HashSet::with_capacity(self.manifest.len());
        let mut urls = Vec::with_capacity(self.manifest.len());
        for entry in &self.manifest {
            let mut url = self.origin.join(entry).map_err(|e| {
                ServiceWorkerError::Config(format!("manifest entry {entry:?}: {e}"))
            })?;
            url.set_fragment(None);
            if !seen.insert(url.clone()) {
                return Err(ServiceWorkerError::Config(format!(
                    "manifest lists {url} more than once"
                )));
            }
            urls.push(url);
        }
        Ok(urls)
    }
}

/// Policy the lifecycle host applies around each phase.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Retries for a failed install. The manager itself never retries.
    pub install_retry: RetryConfig,
    /// Install or activate running longer than this is aborted.
    pub phase_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            install_retry: RetryConfig::none(),
            phase_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://app.example/").unwrap()
    }

    #[test]
    fn test_compiled_in_defaults() {
        let config = CacheConfig::for_origin(origin());
        assert_eq!(config.version, "my-pwa-cache-v3");

        let urls: Vec<String> = config
            .manifest_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            urls,
            vec![
                "https://app.example/",
                "https://app.example/index.html",
                "https://app.example/bg.webp",
                "https://app.example/bg_mobile.webp",
            ]
        );
    }

    #[test]
    fn test_manifest_resolves_under_subpath_origin() {
        let config = CacheConfig::new(
            "v1",
            Url::parse("https://host.example/app/").unwrap(),
            ["./", "style.css", "/favicon.ico"],
        );
        let urls = config.manifest_urls().unwrap();
        assert_eq!(urls[0].as_str(), "https://host.example/app/");
        assert_eq!(urls[1].as_str(), "https://host.example/app/style.css");
        assert_eq!(urls[2].as_str(), "https://host.example/favicon.ico");
    }

    #[test]
    fn test_duplicate_manifest_entry_rejected() {
        let config = CacheConfig::new("v1", origin(), ["/index.html", "index.html#main"]);
        assert!(matches!(
            config.manifest_urls(),
            Err(ServiceWorkerError::Config(msg)) if msg.contains("more than once")
        ));
    }

    #[test]
    fn test_empty_version_rejected() {
        let config = CacheConfig::new(" ", origin(), ["/"]);
        assert!(matches!(
            config.manifest_urls(),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[test]
    fn test_opaque_origin_rejected() {
        let config = CacheConfig::new("v1", Url::parse("data:text/plain,hi").unwrap(), ["/"]);
        assert!(config.manifest_urls().is_err());
    }

    #[test]
    fn test_host_options_default_has_no_retries() {
        let options = HostOptions::default();
        assert_eq!(options.install_retry.max_attempts, 1);
        assert_eq!(options.phase_timeout, Duration::from_secs(300));
    }
}
