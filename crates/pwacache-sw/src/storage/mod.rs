//! Cache Storage: named buckets of request → response entries.
//!
//! The traits here are the storage collaborator the manager is built
//! against. Entries are written in batches by install and never edited
//! afterwards; buckets are replaced wholesale by version rotation.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwacache_common::{PwaError, Result};
use pwacache_net::{Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

mod disk;
mod memory;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;

// ==================== Keys ====================

/// Lookup key for a stored response: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

// ==================== Entries ====================

/// One response header. The value is kept as raw bytes since HTTP allows
/// non-UTF-8 octets there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "bytes_base64")]
    pub value: Bytes,
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request method.
    pub method: String,

    /// Request URL (the lookup key, fragment stripped).
    pub url: String,

    /// Final response URL after redirects.
    pub response_url: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order; repeated names are kept.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "bytes_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` as the answer to `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let key = CacheKey::for_request(request);
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: Bytes::copy_from_slice(value.as_bytes()),
            })
            .collect();

        Self {
            method: key.method,
            url: key.url,
            response_url: response.url.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild the response this entry was taken from.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.response_url).map_err(|e| {
            PwaError::storage_with_source(format!("corrupt entry for {}", self.url), e)
        })?;
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            PwaError::storage_with_source(format!("corrupt status for {}", self.url), e)
        })?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for header in &self.headers {
            let name = HeaderName::try_from(header.name.as_str()).map_err(|e| {
                PwaError::storage_with_source(format!("corrupt header name for {}", self.url), e)
            })?;
            let value = HeaderValue::from_bytes(&header.value).map_err(|e| {
                PwaError::storage_with_source(format!("corrupt header value for {}", self.url), e)
            })?;
            headers.append(name, value);
        }

        Ok(Response::new(url, status, headers, self.body.clone()))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Traits ====================

/// One named bucket.
#[async_trait]
pub trait CacheBucket: Send + Sync {
    /// Bucket name (the version tag).
    fn name(&self) -> &str;

    /// Exact method + URL lookup.
    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>>;

    /// Store a batch. Either every entry lands or none does; an entry whose
    /// key is already present replaces the old one.
    async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<()>;

    /// Keys currently stored, in no particular order.
    async fn keys(&self) -> Result<Vec<CacheKey>>;

    async fn len(&self) -> Result<usize> {
        Ok(self.keys().await?.len())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// The set of buckets (`caches` global).
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if it doesn't exist.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>>;

    /// Open a bucket only if it exists.
    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> Result<bool> {
        Ok(self.get(name).await?.is_some())
    }

    /// Bucket names in creation order.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Delete a bucket. Returns `false` if it did not exist. Handles already
    /// obtained for it stay readable but reject writes.
    async fn delete(&self, name: &str) -> Result<bool>;
}
