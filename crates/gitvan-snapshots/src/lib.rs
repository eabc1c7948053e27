//! Content-addressed snapshot store backed by git blobs.
//!
//! Each key owns a ref `refs/gitvan/snapshots/<key>` pointing at a small
//! JSON header blob; the header names the data blob, which holds the
//! canonical-JSON rendering of the snapshot. The content hash is SHA-256
//! of those canonical bytes, so equal content always hashes equal. An
//! in-memory LRU fronts the git store; evicting from it never loses data.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use gitvan_core::{canonical_json, hash_bytes, now_ms, validate_name, Config, Error, Result};
use gitvan_git::GitRepo;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const SNAP_PREFIX: &str = "refs/gitvan/snapshots/";

/// Header blob behind `refs/gitvan/snapshots/<key>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub key: String,
    pub content_hash: String,
    /// Git sha of the canonical-JSON data blob.
    pub blob: String,
    pub size_bytes: u64,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: u64,
    pub hit_rate: f64,
}

#[derive(Clone, Debug, Default)]
pub struct CleanupOptions {
    /// Delete snapshots older than this many milliseconds.
    pub older_than_ms: Option<u64>,
    /// After the age pass, delete oldest-first until the summed data size
    /// fits this budget.
    pub max_total_bytes: Option<u64>,
}

struct CacheEntry {
    content_hash: String,
    data: Value,
    bytes: u64,
}

struct Cache {
    entries: LruCache<String, CacheEntry>,
    bytes: u64,
    max_bytes: u64,
    hits: u64,
    misses: u64,
}

impl Cache {
    fn insert(&mut self, key: &str, entry: CacheEntry) {
        if let Some(old) = self.entries.put(key.to_string(), entry) {
            self.bytes = self.bytes.saturating_sub(old.bytes);
        }
        if let Some(new) = self.entries.peek(key) {
            self.bytes += new.bytes;
        }
        while self.bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes = self.bytes.saturating_sub(evicted.bytes),
                None => break,
            }
        }
    }

    fn drop_key(&mut self, key: &str) {
        if let Some(old) = self.entries.pop(key) {
            self.bytes = self.bytes.saturating_sub(old.bytes);
        }
    }
}

pub struct SnapshotStore {
    repo: Arc<GitRepo>,
    cache: Mutex<Cache>,
}

impl SnapshotStore {
    pub fn new(repo: Arc<GitRepo>, config: &Config) -> Self {
        let cap = NonZeroUsize::new(config.snapshot_max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            repo,
            cache: Mutex::new(Cache {
                entries: LruCache::new(cap),
                bytes: 0,
                max_bytes: config.snapshot_max_bytes,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Store `data` under `key` and return its content hash. Storing equal
    /// canonical content twice returns the same hash and is a no-op on the
    /// git side.
    pub async fn store(
        &self,
        key: &str,
        data: Value,
        metadata: Option<Value>,
    ) -> Result<String> {
        validate_name(key)?;
        let canon = canonical_json(&data)?;
        let hash = hash_bytes(canon.as_bytes());
        let reference = snap_ref(key);

        if let Some(existing) = self.read_header(&reference).await? {
            if existing.content_hash == hash {
                self.cache().insert(
                    key,
                    CacheEntry {
                        content_hash: hash.clone(),
                        data,
                        bytes: canon.len() as u64,
                    },
                );
                return Ok(hash);
            }
        }

        let blob = self.repo.write_blob(canon.as_bytes()).await?;
        let header = SnapshotHeader {
            key: key.to_string(),
            content_hash: hash.clone(),
            blob,
            size_bytes: canon.len() as u64,
            timestamp_ms: now_ms(),
            metadata: metadata.unwrap_or(Value::Null),
            commit: self.repo.head_commit().await.ok(),
            branch: self.repo.current_branch().await.unwrap_or(None),
        };
        let header_bytes =
            serde_json::to_vec(&header).map_err(|e| Error::corruption("snapshot header", e))?;
        let header_sha = self.repo.write_blob(&header_bytes).await?;
        self.repo.set_ref(&reference, &header_sha).await?;

        self.cache().insert(
            key,
            CacheEntry {
                content_hash: hash.clone(),
                data,
                bytes: canon.len() as u64,
            },
        );
        Ok(hash)
    }

    /// Fetch a snapshot, optionally pinned to a content hash. Missing keys
    /// and hash mismatches are `None`; corrupt headers or blobs are
    /// tolerated on read (logged, `None`).
    pub async fn get(&self, key: &str, want_hash: Option<&str>) -> Result<Option<Value>> {
        validate_name(key)?;

        {
            let mut cache = self.cache();
            if let Some(entry) = cache.entries.get(key) {
                if want_hash.map_or(true, |w| w == entry.content_hash) {
                    let data = entry.data.clone();
                    cache.hits += 1;
                    return Ok(Some(data));
                }
            }
            cache.misses += 1;
        }

        let header = match self.read_header(&snap_ref(key)).await? {
            Some(h) => h,
            None => return Ok(None),
        };
        if let Some(want) = want_hash {
            if want != header.content_hash {
                return Ok(None);
            }
        }

        let bytes = match self.repo.read_blob(&header.blob).await {
            Ok(b) => b,
            Err(Error::Git { .. }) => {
                warn!("snapshot {} data blob {} is missing", key, header.blob);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let data: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("snapshot {} data is corrupt: {}", key, e);
                return Ok(None);
            }
        };

        self.cache().insert(
            key,
            CacheEntry {
                content_hash: header.content_hash,
                data: data.clone(),
                bytes: header.size_bytes,
            },
        );
        Ok(Some(data))
    }

    pub async fn has(&self, key: &str, want_hash: Option<&str>) -> Result<bool> {
        validate_name(key)?;
        {
            let cache = self.cache();
            if let Some(entry) = cache.entries.peek(key) {
                if want_hash.map_or(true, |w| w == entry.content_hash) {
                    return Ok(true);
                }
            }
        }
        match self.read_header(&snap_ref(key)).await? {
            Some(h) => Ok(want_hash.map_or(true, |w| w == h.content_hash)),
            None => Ok(false),
        }
    }

    pub async fn list(&self) -> Result<Vec<SnapshotHeader>> {
        let mut headers = Vec::new();
        for (reference, _) in self.repo.list_refs(SNAP_PREFIX).await? {
            if let Some(h) = self.read_header(&reference).await? {
                headers.push(h);
            }
        }
        Ok(headers)
    }

    pub async fn remove(&self, key: &str, want_hash: Option<&str>) -> Result<bool> {
        validate_name(key)?;
        let reference = snap_ref(key);
        let sha = match self.repo.read_ref(&reference).await? {
            Some(s) => s,
            None => return Ok(false),
        };
        if let Some(want) = want_hash {
            match self.read_header(&reference).await? {
                Some(h) if h.content_hash == want => {}
                _ => return Ok(false),
            }
        }
        let deleted = self.repo.delete_ref_expecting(&reference, &sha).await?;
        if deleted {
            self.cache().drop_key(key);
        }
        Ok(deleted)
    }

    /// Retention sweep: first an age pass, then delete oldest-first until
    /// the byte budget holds. Returns the number of snapshots deleted.
    pub async fn cleanup(&self, opts: CleanupOptions) -> Result<usize> {
        let mut survivors: Vec<(String, String, SnapshotHeader)> = Vec::new();
        let mut doomed: Vec<(String, String, SnapshotHeader)> = Vec::new();
        let now = now_ms();

        for (reference, sha) in self.repo.list_refs(SNAP_PREFIX).await? {
            let header = match self.read_header(&reference).await? {
                Some(h) => h,
                None => continue,
            };
            let age = now.saturating_sub(header.timestamp_ms);
            if opts.older_than_ms.map_or(false, |max_age| age > max_age) {
                doomed.push((reference, sha, header));
            } else {
                survivors.push((reference, sha, header));
            }
        }

        if let Some(budget) = opts.max_total_bytes {
            survivors.sort_by_key(|(_, _, h)| h.timestamp_ms);
            let mut total: u64 = survivors.iter().map(|(_, _, h)| h.size_bytes).sum();
            while total > budget {
                match survivors.first() {
                    Some((_, _, h)) => total -= h.size_bytes,
                    None => break,
                }
                doomed.push(survivors.remove(0));
            }
        }

        let mut removed = 0;
        for (reference, sha, header) in doomed {
            if self.repo.delete_ref_expecting(&reference, &sha).await? {
                self.cache().drop_key(&header.key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn statistics(&self) -> CacheStatistics {
        let cache = self.cache();
        let total = cache.hits + cache.misses;
        CacheStatistics {
            hits: cache.hits,
            misses: cache.misses,
            entries: cache.entries.len(),
            size_bytes: cache.bytes,
            hit_rate: if total == 0 {
                0.0
            } else {
                cache.hits as f64 / total as f64
            },
        }
    }

    async fn read_header(&self, reference: &str) -> Result<Option<SnapshotHeader>> {
        let sha = match self.repo.read_ref(reference).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        let bytes = match self.repo.read_blob(&sha).await {
            Ok(b) => b,
            Err(Error::Git { .. }) => {
                warn!("snapshot ref {} points at missing header {}", reference, sha);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(h) => Ok(Some(h)),
            Err(e) => {
                warn!("snapshot header at {} is corrupt: {}", reference, e);
                Ok(None)
            }
        }
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn snap_ref(key: &str) -> String {
    format!("{}{}", SNAP_PREFIX, key)
}
