//! In-memory Cache Storage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use pwacache_common::{PwaError, Result};
use pwacache_net::Request;
use tokio::sync::RwLock;
use tracing::trace;

use super::{CacheBucket, CacheEntry, CacheKey, CacheStorage};

/// A bucket held in memory.
#[derive(Debug)]
pub struct MemoryBucket {
    name: String,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    deleted: AtomicBool,
}

impl MemoryBucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: RwLock::new(HashMap::new()),
            deleted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl CacheBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>> {
        let key = CacheKey::for_request(request);
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn put_all(&self, batch: Vec<CacheEntry>) -> Result<()> {
        let mut entries = self.entries.write().await;
        // Checked under the write lock so a concurrent delete can't slip in between.
        if self.deleted.load(Ordering::Acquire) {
            return Err(PwaError::NotFound(format!("cache bucket {}", self.name)));
        }
        for entry in batch {
            trace!(bucket = %self.name, key = %entry.key(), "Storing entry");
            entries.insert(entry.key(), entry);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Cache storage backed by process memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    // Creation order is the `keys()` order.
    buckets: RwLock<Vec<Arc<MemoryBucket>>>,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>> {
        if let Some(bucket) = self.get(name).await? {
            return Ok(bucket);
        }

        let mut buckets = self.buckets.write().await;
        // Someone may have created it while we waited for the write lock.
        if let Some(bucket) = buckets.iter().find(|b| b.name == name) {
            return Ok(bucket.clone());
        }
        let bucket = Arc::new(MemoryBucket::new(name));
        buckets.push(bucket.clone());
        Ok(bucket)
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.clone() as Arc<dyn CacheBucket>))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .read()
            .await
            .iter()
            .map(|b| b.name.clone())
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let removed = {
            let mut buckets = self.buckets.write().await;
            match buckets.iter().position(|b| b.name == name) {
                Some(index) => buckets.remove(index),
                None => return Ok(false),
            }
        };
        let _guard = removed.entries.write().await;
        removed.deleted.store(true, Ordering::Release);
        Ok(true)
    }
}
