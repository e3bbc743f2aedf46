//! # pwacache Service Worker
//!
//! A versioned offline asset cache driven by service worker lifecycle events.
//!
//! ## Features
//!
//! - **Install**: precache a fixed manifest into the bucket named by the version tag
//! - **Activate**: delete every bucket that does not match the version tag
//! - **Fetch**: cache-first, falling back to a live network fetch that is never stored
//! - **Storage**: in-memory and on-disk Cache Storage implementations
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     ├── installing ─┐
//!     ├── waiting     ├── ServiceWorkerHost (lifecycle state machine)
//!     └── active     ─┘        │
//!                              └── OfflineCacheManager
//!                                      ├── CacheStorage ── CacheBucket (version tag)
//!                                      │                       └── CacheKey → CacheEntry
//!                                      └── Fetcher (network)
//! ```

use std::time::Duration;

use http::StatusCode;
use pwacache_common::PwaError;
use pwacache_net::NetError;
use thiserror::Error;
use url::Url;

pub mod config;
pub mod host;
pub mod manager;
pub mod registration;
pub mod storage;

pub use config::{CacheConfig, HostOptions, CACHE_VERSION, PRECACHE_MANIFEST};
pub use host::{ServiceWorkerHost, ServiceWorkerId, ServiceWorkerState, WorkerEvent};
pub use manager::{ActivateReport, FetchResponse, InstallReport, OfflineCacheManager, ResponseSource};
pub use registration::Registration;
pub use storage::{
    CacheBucket, CacheEntry, CacheKey, CacheStorage, DiskCacheStorage, MemoryCacheStorage,
    StoredHeader,
};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    /// A manifest asset could not be fetched during install.
    #[error("Precache of {url} failed: {source}")]
    InstallAssetFetch {
        url: Url,
        #[source]
        source: NetError,
    },

    /// A manifest asset answered with a non-2xx status during install.
    #[error("Precache of {url} returned status {status}")]
    InstallAssetStatus { url: Url, status: StatusCode },

    /// Cache storage failure.
    #[error("Cache error: {0}")]
    Storage(#[from] PwaError),

    /// Cache miss whose network fetch failed. Surfaced as-is.
    #[error(transparent)]
    Network(NetError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("State error: {0}")]
    StateError(String),

    /// The host aborted a lifecycle phase that ran too long.
    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        phase: &'static str,
        timeout: Duration,
    },
}

impl ServiceWorkerError {
    /// Whether the host may reasonably retry the failed phase.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceWorkerError::InstallAssetFetch { source, .. } => source.is_transient(),
            ServiceWorkerError::InstallAssetStatus { status, .. } => status.is_server_error(),
            ServiceWorkerError::Storage(e) => e.is_retryable(),
            ServiceWorkerError::Timeout { .. } => true,
            ServiceWorkerError::Network(_)
            | ServiceWorkerError::Config(_)
            | ServiceWorkerError::StateError(_) => false,
        }
    }
}
