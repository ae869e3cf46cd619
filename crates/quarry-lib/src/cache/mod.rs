//! Content-addressed download cache.
//!
//! The index is a single JSON manifest next to the cached blobs. Entries are
//! keyed by source URL and validated by size + SHA-256 on every read, so a
//! cache hit is indistinguishable from a fresh correct download. Files that
//! already landed at their install destination are indexed in place rather
//! than copied.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::hash::{self, Algorithms, FileHash};

const INDEX_VERSION: u32 = 1;

/// Each access is worth one minute of recency in the eviction score.
const ACCESS_BONUS_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_bytes: u64,
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 4 * 1024 * 1024 * 1024,
            max_age: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub path: PathBuf,
    pub hash: FileHash,
    pub created_at_ms: u64,
    pub last_accessed_ms: u64,
    pub access_count: u64,
}

impl CacheEntry {
    /// Eviction keeps the entries with the highest score.
    fn score(&self) -> u64 {
        self.last_accessed_ms
            .saturating_add(self.access_count.saturating_mul(ACCESS_BONUS_MS))
    }
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Hash-keyed persistent cache with score-based eviction.
pub struct CacheStore {
    cache_dir: PathBuf,
    index_path: PathBuf,
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open the cache, loading the index and pruning entries past their TTL.
    pub async fn open(cache_dir: PathBuf, config: CacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cache_dir).await?;
        let index_path = cache_dir.join("index.json");

        let mut entries = match tokio::fs::read_to_string(&index_path).await {
            Ok(data) => match serde_json::from_str::<IndexSnapshot>(&data) {
                Ok(snapshot) => snapshot
                    .entries
                    .into_iter()
                    .map(|e| (e.url.clone(), e))
                    .collect(),
                Err(e) => {
                    log::warn!("cache index unreadable, starting empty: {e}");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        // Age-based prune happens once, on open.
        let now = now_ms();
        let max_age_ms = config.max_age.as_millis() as u64;
        let expired: Vec<String> = entries
            .values()
            .filter(|e| now.saturating_sub(e.created_at_ms) > max_age_ms)
            .map(|e| e.url.clone())
            .collect();
        for url in &expired {
            if let Some(entry) = entries.remove(url) {
                log::debug!("pruning expired cache entry: {url}");
                delete_owned_file(&cache_dir, &entry.path).await;
            }
        }

        let store = Self {
            cache_dir,
            index_path,
            config,
            entries: Mutex::new(entries),
        };
        if !expired.is_empty() {
            let entries = store.entries.lock().await;
            store.persist(&entries).await?;
        }
        Ok(store)
    }

    /// Look up a URL, revalidating the blob before handing it out. A failed
    /// validation evicts the entry and reports a miss.
    pub async fn get(&self, url: &str) -> Result<Option<PathBuf>> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(url).cloned() else {
            return Ok(None);
        };

        if let Err(e) = self.revalidate(&entry).await {
            log::warn!("evicting {url}: {e}");
            entries.remove(url);
            delete_owned_file(&self.cache_dir, &entry.path).await;
            self.persist(&entries).await?;
            return Ok(None);
        }

        let entry = entries.get_mut(url).expect("entry present");
        entry.last_accessed_ms = now_ms();
        entry.access_count += 1;
        let path = entry.path.clone();
        self.persist(&entries).await?;
        Ok(Some(path))
    }

    /// Record a blob for a URL. The source file is verified against `hash`
    /// first and referenced in place.
    pub async fn put(&self, url: &str, src: &Path, file_hash: FileHash) -> Result<()> {
        let actual = hash::hash_file(src, Algorithms::SHA256_ONLY).await?;
        if actual.size != file_hash.size || !actual.sha256.eq_ignore_ascii_case(&file_hash.sha256) {
            return Err(Error::HashMismatch {
                path: src.to_path_buf(),
                expected: file_hash.sha256,
                actual: actual.sha256,
            });
        }

        let mut entries = self.entries.lock().await;

        // Replacing an entry frees its budget before eviction math runs.
        if let Some(old) = entries.remove(url) {
            if old.path != src {
                delete_owned_file(&self.cache_dir, &old.path).await;
            }
        }

        self.evict_for(&mut entries, file_hash.size).await;

        let now = now_ms();
        entries.insert(
            url.to_string(),
            CacheEntry {
                url: url.to_string(),
                path: src.to_path_buf(),
                hash: file_hash,
                created_at_ms: now,
                last_accessed_ms: now,
                access_count: 0,
            },
        );
        self.persist(&entries).await
    }

    pub async fn remove(&self, url: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.remove(url) {
            delete_owned_file(&self.cache_dir, &entry.path).await;
            self.persist(&entries).await?;
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for entry in entries.values() {
            delete_owned_file(&self.cache_dir, &entry.path).await;
        }
        entries.clear();
        self.persist(&entries).await
    }

    /// Walk every entry, drop the corrupted ones, and sweep staging leftovers.
    /// Invoked on service start.
    pub async fn verify_integrity(&self) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let urls: Vec<String> = entries.keys().cloned().collect();
        let mut removed = 0usize;

        for url in urls {
            let entry = entries.get(&url).cloned().expect("entry present");
            if let Err(e) = self.revalidate(&entry).await {
                log::debug!("integrity check evicting {url}: {e}");
                entries.remove(&url);
                delete_owned_file(&self.cache_dir, &entry.path).await;
                removed += 1;
            }
        }

        sweep_tmp_files(&self.cache_dir).await;

        if removed > 0 {
            log::info!("cache integrity check evicted {removed} entries");
        }
        self.persist(&entries).await
    }

    pub async fn total_bytes(&self) -> u64 {
        let entries = self.entries.lock().await;
        entries.values().map(|e| e.hash.size).sum()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Re-check the entry's invariant: the file exists with the recorded
    /// size and SHA-256.
    async fn revalidate(&self, entry: &CacheEntry) -> Result<()> {
        let meta = tokio::fs::metadata(&entry.path)
            .await
            .map_err(|e| Error::CacheCorrupt(format!("{} unreadable: {e}", entry.path.display())))?;
        if meta.len() != entry.hash.size {
            return Err(Error::CacheCorrupt(format!(
                "{} is {} bytes, index says {}",
                entry.path.display(),
                meta.len(),
                entry.hash.size
            )));
        }
        let actual = hash::hash_file(&entry.path, Algorithms::SHA256_ONLY)
            .await
            .map_err(|e| Error::CacheCorrupt(format!("hashing {} failed: {e}", entry.path.display())))?;
        if !actual.sha256.eq_ignore_ascii_case(&entry.hash.sha256) {
            return Err(Error::CacheCorrupt(format!(
                "{} sha256 drifted from index",
                entry.path.display()
            )));
        }
        Ok(())
    }

    /// Evict lowest-score entries until `additional` bytes fit in the budget.
    async fn evict_for(&self, entries: &mut HashMap<String, CacheEntry>, additional: u64) {
        loop {
            let total: u64 = entries.values().map(|e| e.hash.size).sum();
            if total.saturating_add(additional) <= self.config.max_bytes {
                return;
            }
            let Some(victim) = entries
                .values()
                .min_by_key(|e| e.score())
                .map(|e| e.url.clone())
            else {
                return;
            };
            let entry = entries.remove(&victim).expect("victim present");
            log::debug!("evicting cache entry {} (score {})", victim, entry.score());
            delete_owned_file(&self.cache_dir, &entry.path).await;
        }
    }

    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let snapshot = IndexSnapshot {
            version: INDEX_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = self.index_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }
}

/// The cache only deletes blobs it owns; entries indexing files at their
/// install destination just drop the index record.
async fn delete_owned_file(cache_dir: &Path, path: &Path) {
    if path.starts_with(cache_dir) {
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn sweep_tmp_files(cache_dir: &Path) {
    let Ok(mut dir) = tokio::fs::read_dir(cache_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let path = entry.path();
        let is_tmp = path
            .extension()
            .map(|e| e == "tmp" || e == "part")
            .unwrap_or(false);
        if is_tmp {
            log::debug!("sweeping staging leftover {}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
