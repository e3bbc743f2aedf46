//! On-disk Cache Storage.
//!
//! Each bucket is one JSON file under the storage root, named after the
//! percent-encoded bucket name. The file name is authoritative: a bucket
//! whose contents cannot be parsed is still listed, so it can be deleted,
//! and `open` replaces it with an empty one. Writes go to a temp file that
//! is renamed over the old one, so a batch lands entirely or not at all.
//! Opened buckets keep an in-memory index; lookups never touch the disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use pwacache_common::{PwaError, Result, ResultExt};
use pwacache_net::Request;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{now_millis, CacheBucket, CacheEntry, CacheKey, CacheStorage};

const BUCKET_SUFFIX: &str = ".bucket.json";

/// Serialized form of one bucket.
#[derive(Debug, Serialize, Deserialize)]
struct BucketFile {
    name: String,
    created_at: u64,
    entries: Vec<CacheEntry>,
}

/// Just enough of a bucket file to order it; `entries` is skipped unparsed.
#[derive(Deserialize)]
struct BucketHeader {
    created_at: u64,
}

/// A bucket persisted as a single file.
#[derive(Debug)]
pub struct DiskBucket {
    name: String,
    path: PathBuf,
    created_at: u64,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    // Serializes writers; readers only take `entries`.
    write_lock: Mutex<()>,
    deleted: AtomicBool,
}

impl DiskBucket {
    fn new(name: &str, path: PathBuf, created_at: u64, entries: Vec<CacheEntry>) -> Self {
        Self {
            name: name.to_string(),
            path,
            created_at,
            entries: RwLock::new(entries.into_iter().map(|e| (e.key(), e)).collect()),
            write_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    async fn create(name: &str, path: PathBuf) -> Result<Self> {
        let bucket = Self::new(name, path, now_millis(), Vec::new());
        bucket.persist(Vec::new()).await?;
        Ok(bucket)
    }

    async fn persist(&self, entries: Vec<CacheEntry>) -> Result<()> {
        let file = BucketFile {
            name: self.name.clone(),
            created_at: self.created_at,
            entries,
        };
        let json = serde_json::to_vec(&file)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)
            .await
            .storage_context(format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .await
            .storage_context(format!("replacing {}", self.path.display()))
    }
}

#[async_trait]
impl CacheBucket for DiskBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<CacheEntry>> {
        let key = CacheKey::for_request(request);
        Ok(self.entries.read().await.get(&key).cloned())
    }

    async fn put_all(&self, batch: Vec<CacheEntry>) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        if self.deleted.load(Ordering::Acquire) {
            return Err(PwaError::NotFound(format!("cache bucket {}", self.name)));
        }

        let mut next = self.entries.read().await.clone();
        for entry in batch {
            next.insert(entry.key(), entry);
        }

        // Disk first: if the write fails the index stays as it was.
        self.persist(next.values().cloned().collect()).await?;
        *self.entries.write().await = next;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// What a bucket file on disk turned out to hold.
enum Slot {
    Missing,
    Corrupt(serde_json::Error),
    Ready(Arc<DiskBucket>),
}

/// Cache storage persisted under a directory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    root: PathBuf,
    // Handles already loaded, so every `open` of a name shares one index.
    // Bucket files are only created or removed under the write lock.
    open: RwLock<HashMap<String, Arc<DiskBucket>>>,
}

impl DiskCacheStorage {
    /// Use `root` as the storage directory, creating it if needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .storage_context(format!("creating {}", root.display()))?;
        debug!(root = %root.display(), "Disk cache storage ready");
        Ok(Self {
            root,
            open: RwLock::new(HashMap::new()),
        })
    }

    /// Storage directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}{BUCKET_SUFFIX}", urlencoding::encode(name)))
    }

    /// Bucket name a directory entry stands for, if it is a bucket file.
    fn bucket_name(file_name: &str) -> Option<String> {
        let encoded = file_name.strip_suffix(BUCKET_SUFFIX)?;
        urlencoding::decode(encoded).ok().map(|name| name.into_owned())
    }

    /// Find a loaded handle, or load it from disk without holding the map.
    async fn lookup(&self, name: &str) -> Result<Slot> {
        if let Some(bucket) = self.open.read().await.get(name) {
            return Ok(Slot::Ready(bucket.clone()));
        }

        let path = self.bucket_path(name);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Slot::Missing),
            Err(e) => {
                return Err(PwaError::storage_with_source(
                    format!("reading {}", path.display()),
                    e,
                ))
            }
        };
        let file: BucketFile = match serde_json::from_slice(&raw) {
            Ok(file) => file,
            Err(e) => return Ok(Slot::Corrupt(e)),
        };
        let loaded = Arc::new(DiskBucket::new(name, path, file.created_at, file.entries));

        let mut open = self.open.write().await;
        if let Some(bucket) = open.get(name) {
            return Ok(Slot::Ready(bucket.clone()));
        }
        // Deleted while we were reading.
        if !fs::try_exists(&loaded.path)
            .await
            .storage_context(format!("probing {}", loaded.path.display()))?
        {
            return Ok(Slot::Missing);
        }
        open.insert(name.to_string(), loaded.clone());
        Ok(Slot::Ready(loaded))
    }

    /// Creation time used for ordering, `None` if the file is gone.
    /// Unreadable buckets sort first.
    async fn created_at(&self, name: &str, path: &Path) -> Result<Option<u64>> {
        if let Some(bucket) = self.open.read().await.get(name) {
            return Ok(Some(bucket.created_at));
        }
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PwaError::storage_with_source(
                    format!("reading {}", path.display()),
                    e,
                ))
            }
        };
        match serde_json::from_slice::<BucketHeader>(&raw) {
            Ok(header) => Ok(Some(header.created_at)),
            Err(e) => {
                warn!(bucket = name, error = %e, "Bucket file is unreadable");
                Ok(Some(0))
            }
        }
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheBucket>> {
        match self.lookup(name).await? {
            Slot::Ready(bucket) => return Ok(bucket),
            Slot::Corrupt(e) => {
                warn!(bucket = name, error = %e, "Replacing unreadable bucket file")
            }
            Slot::Missing => {}
        }

        let mut open = self.open.write().await;
        if let Some(bucket) = open.get(name) {
            return Ok(bucket.clone());
        }
        let bucket = Arc::new(DiskBucket::create(name, self.bucket_path(name)).await?);
        debug!(bucket = name, "Created cache bucket");
        open.insert(name.to_string(), bucket.clone());
        Ok(bucket)
    }

    async fn get(&self, name: &str) -> Result<Option<Arc<dyn CacheBucket>>> {
        match self.lookup(name).await? {
            Slot::Ready(bucket) => Ok(Some(bucket as Arc<dyn CacheBucket>)),
            Slot::Missing => Ok(None),
            Slot::Corrupt(e) => {
                warn!(bucket = name, error = %e, "Treating unreadable bucket as absent");
                Ok(None)
            }
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .storage_context(format!("listing {}", self.root.display()))?;

        let mut found = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .storage_context(format!("listing {}", self.root.display()))?
        {
            let Some(name) = item.file_name().to_str().and_then(Self::bucket_name) else {
                continue;
            };
            if let Some(created_at) = self.created_at(&name, &item.path()).await? {
                found.push((created_at, name));
            }
        }

        found.sort();
        Ok(found.into_iter().map(|(_, name)| name).collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let mut open = self.open.write().await;
        let handle = open.remove(name);
        // Block writers on the old handle before the file goes away.
        let _writer = match &handle {
            Some(bucket) => {
                let guard = bucket.write_lock.lock().await;
                bucket.deleted.store(true, Ordering::Release);
                Some(guard)
            }
            None => None,
        };

        let path = self.bucket_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(bucket = name, "Deleted cache bucket");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PwaError::storage_with_source(
                format!("deleting {}", path.display()),
                e,
            )),
        }
    }
}
