//! Managed quota for disk caches
//!
//! Keeps an in-memory index of cached objects with a use sequence number.
//! Cleanup evicts least recently used, unpinned objects first. At clean
//! shutdown the index is written to `quota.json` so the next start can skip
//! the directory scan.

use super::{format_bytes, QuotaPolicy, SharingMode};
use crate::cache::disk::{object_path, OBJECTS_DIR};
use crate::cache::ContentKey;
use crate::error::{StrataError, StrataResult};
use crate::workspace::RegionLock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Name of the index file written at clean shutdown
pub const LEDGER_FILE: &str = "quota.json";
/// Region lock serializing accounting passes between processes
pub const REGION_LOCK_FILE: &str = "quota.lock";

const LEDGER_VERSION: u32 = 1;

/// Parameters of [`DiskQuota::open`]
#[derive(Debug, Clone)]
pub struct DiskQuotaConfig {
    pub cache_path: PathBuf,
    /// Bytes
    pub capacity: u64,
    pub mode: SharingMode,
    /// Serialize construction and cleanup through `quota.lock`
    pub region_lock: bool,
    /// A crash leaves the ledger untrustworthy
    pub had_prior_crash: bool,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    size: u64,
    seq: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<ContentKey, Entry>,
    pinned: HashSet<ContentKey>,
    total: u64,
    next_seq: u64,
}

impl Index {
    fn from_scan(mut found: Vec<(ContentKey, u64, SystemTime)>) -> Self {
        found.sort_by_key(|(_, _, mtime)| *mtime);
        let mut index = Self::default();
        for (key, size, _) in found {
            index.upsert(key, size);
        }
        index
    }

    fn upsert(&mut self, key: ContentKey, size: u64) {
        let seq = self.bump();
        if let Some(old) = self.entries.insert(key, Entry { size, seq }) {
            self.total -= old.size;
        }
        self.total += size;
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn drop_entry(&mut self, key: &ContentKey) -> Option<u64> {
        let entry = self.entries.remove(key)?;
        self.total -= entry.size;
        Some(entry.size)
    }

    /// Least recently used unpinned entries whose removal brings the total to `leave_size`
    fn victims(&self, leave_size: u64) -> Vec<(ContentKey, u64)> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| !self.pinned.contains(*key))
            .collect();
        candidates.sort_by_key(|(_, entry)| entry.seq);

        let mut remaining = self.total;
        let mut victims = Vec::new();
        for (key, entry) in candidates {
            if remaining <= leave_size {
                break;
            }
            remaining -= entry.size;
            victims.push((key.clone(), entry.size));
        }
        victims
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Ledger {
    version: u32,
    saved_at: DateTime<Utc>,
    next_seq: u64,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerEntry {
    key: String,
    size: u64,
    seq: u64,
}

/// LRU quota over a disk cache directory
#[derive(Debug)]
pub struct DiskQuota {
    config: DiskQuotaConfig,
    index: Mutex<Index>,
}

impl DiskQuota {
    /// Build the index from the ledger or, failing that, a directory scan
    pub async fn open(config: DiskQuotaConfig) -> StrataResult<Self> {
        let _region = if config.region_lock {
            Some(RegionLock::lock(&config.cache_path.join(REGION_LOCK_FILE)).await?)
        } else {
            None
        };

        let ledger_usable = config.mode == SharingMode::Exclusive && !config.had_prior_crash;
        let index = match load_ledger(&config.cache_path, ledger_usable)? {
            Some(index) => {
                debug!("Loaded quota ledger with {} entries", index.entries.len());
                index
            }
            None => scan(&config.cache_path).await?,
        };

        info!(
            "Opened {} disk quota on {} ({} of {} in use)",
            config.mode,
            config.cache_path.display(),
            format_bytes(index.total),
            format_bytes(config.capacity)
        );
        Ok(Self {
            config,
            index: Mutex::new(index),
        })
    }

    pub fn cache_path(&self) -> &Path {
        &self.config.cache_path
    }

    /// Number of indexed objects
    pub fn len(&self) -> usize {
        self.index().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Protect an object from eviction
    pub fn pin(&self, key: &ContentKey) {
        self.index().pinned.insert(key.clone());
    }

    pub fn unpin(&self, key: &ContentKey) {
        self.index().pinned.remove(key);
    }

    /// Write the index to `quota.json`; only meaningful in exclusive mode
    pub fn save_ledger(&self) -> StrataResult<()> {
        if self.config.mode != SharingMode::Exclusive {
            return Ok(());
        }
        let ledger = {
            let index = self.index();
            Ledger {
                version: LEDGER_VERSION,
                saved_at: Utc::now(),
                next_seq: index.next_seq,
                entries: index
                    .entries
                    .iter()
                    .map(|(key, entry)| LedgerEntry {
                        key: key.to_string(),
                        size: entry.size,
                        seq: entry.seq,
                    })
                    .collect(),
            }
        };

        let content = serde_json::to_vec(&ledger)?;
        let path = self.config.cache_path.join(LEDGER_FILE);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.config.cache_path)
            .map_err(|e| StrataError::io("creating quota ledger", e))?;
        tmp.write_all(&content)
            .map_err(|e| StrataError::io("writing quota ledger", e))?;
        tmp.persist(&path)
            .map_err(|e| StrataError::io(format!("saving {}", path.display()), e.error))?;
        debug!("Saved quota ledger {}", path.display());
        Ok(())
    }

    fn index(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn region(&self) -> StrataResult<Option<RegionLock>> {
        if !self.config.region_lock {
            return Ok(None);
        }
        RegionLock::lock(&self.config.cache_path.join(REGION_LOCK_FILE))
            .await
            .map(Some)
    }

    /// Pick up objects added or removed by other processes sharing the cache
    async fn rescan(&self) -> StrataResult<()> {
        let fresh = scan(&self.config.cache_path).await?;
        let mut index = self.index();
        let mut merged = Index {
            pinned: std::mem::take(&mut index.pinned),
            next_seq: index.next_seq,
            ..Index::default()
        };
        // Known objects keep their recency; new ones count as oldest.
        for (key, entry) in fresh.entries {
            let seq = index.entries.get(&key).map(|e| e.seq).unwrap_or(0);
            merged.total += entry.size;
            merged.entries.insert(key, Entry { size: entry.size, seq });
        }
        *index = merged;
        Ok(())
    }
}

#[async_trait]
impl QuotaPolicy for DiskQuota {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn mode(&self) -> SharingMode {
        self.config.mode
    }

    async fn capacity(&self) -> StrataResult<u64> {
        Ok(self.config.capacity)
    }

    async fn size(&self) -> StrataResult<u64> {
        Ok(self.index().total)
    }

    async fn insert(&self, key: &ContentKey, size: u64) -> StrataResult<()> {
        self.index().upsert(key.clone(), size);
        Ok(())
    }

    async fn touch(&self, key: &ContentKey) -> StrataResult<()> {
        let mut index = self.index();
        let seq = index.bump();
        if let Some(entry) = index.entries.get_mut(key) {
            entry.seq = seq;
        }
        Ok(())
    }

    async fn remove(&self, key: &ContentKey) -> StrataResult<()> {
        self.index().drop_entry(key);
        Ok(())
    }

    async fn cleanup(&self, leave_size: u64) -> StrataResult<bool> {
        let _region = self.region().await?;
        if self.config.mode == SharingMode::Shared {
            self.rescan().await?;
        }

        let victims = self.index().victims(leave_size);
        let mut freed = 0u64;
        for (key, size) in &victims {
            let path = object_path(&self.config.cache_path, key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to evict {}: {}", path.display(), e);
                    continue;
                }
            }
            self.index().drop_entry(key);
            freed += size;
        }

        let total = self.index().total;
        debug!(
            "Evicted {} objects ({}), {} left",
            victims.len(),
            format_bytes(freed),
            format_bytes(total)
        );
        Ok(total <= leave_size)
    }
}

impl Drop for DiskQuota {
    fn drop(&mut self) {
        if let Err(e) = self.save_ledger() {
            warn!("Failed to save quota ledger: {}", e);
        }
    }
}

/// Read and delete the ledger; `None` means a scan is needed
fn load_ledger(cache_path: &Path, usable: bool) -> StrataResult<Option<Index>> {
    let path = cache_path.join(LEDGER_FILE);
    let content = match std::fs::read(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StrataError::io(format!("reading {}", path.display()), e)),
    };
    // A ledger is only valid for the run that follows the one that wrote it.
    std::fs::remove_file(&path)
        .map_err(|e| StrataError::io(format!("removing {}", path.display()), e))?;

    if !usable {
        debug!("Ignoring quota ledger {}", path.display());
        return Ok(None);
    }
    let ledger: Ledger = match serde_json::from_slice(&content) {
        Ok(ledger) => ledger,
        Err(e) => {
            warn!("Discarding unreadable quota ledger: {}", e);
            return Ok(None);
        }
    };
    if ledger.version != LEDGER_VERSION {
        return Ok(None);
    }

    let mut index = Index {
        next_seq: ledger.next_seq,
        ..Index::default()
    };
    for entry in ledger.entries {
        let Ok(key) = ContentKey::parse(&entry.key) else {
            continue;
        };
        index.next_seq = index.next_seq.max(entry.seq + 1);
        index.total += entry.size;
        index.entries.insert(
            key,
            Entry {
                size: entry.size,
                seq: entry.seq,
            },
        );
    }
    Ok(Some(index))
}

/// Walk `objects/<xx>/<rest>` on a blocking thread
async fn scan(cache_path: &Path) -> StrataResult<Index> {
    let objects = cache_path.join(OBJECTS_DIR);
    let found = tokio::task::spawn_blocking(move || scan_objects(&objects))
        .await
        .map_err(|e| StrataError::Internal(format!("quota scan task failed: {}", e)))?
        .map_err(|e| StrataError::io("scanning cache objects", e))?;
    debug!("Scanned {} cached objects", found.len());
    Ok(Index::from_scan(found))
}

fn scan_objects(objects: &Path) -> io::Result<Vec<(ContentKey, u64, SystemTime)>> {
    let mut found = Vec::new();
    let fanout = match std::fs::read_dir(objects) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e),
    };
    for bucket in fanout {
        let bucket = bucket?;
        if !bucket.file_type()?.is_dir() {
            continue;
        }
        let prefix = bucket.file_name().to_string_lossy().into_owned();
        for object in std::fs::read_dir(bucket.path())? {
            let object = object?;
            let meta = object.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let name = format!("{}{}", prefix, object.file_name().to_string_lossy());
            let Ok(key) = ContentKey::parse(&name) else {
                continue;
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((key, meta.len(), mtime));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(path: &Path, capacity: u64) -> DiskQuotaConfig {
        DiskQuotaConfig {
            cache_path: path.to_path_buf(),
            capacity,
            mode: SharingMode::Exclusive,
            region_lock: false,
            had_prior_crash: false,
        }
    }

    fn put_object(root: &Path, data: &[u8]) -> ContentKey {
        let key = ContentKey::digest(data);
        let path = object_path(root, &key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        key
    }

    #[tokio::test]
    async fn scan_counts_existing_objects() {
        let temp = TempDir::new().unwrap();
        put_object(temp.path(), &[1u8; 100]);
        put_object(temp.path(), &[2u8; 50]);
        std::fs::create_dir_all(temp.path().join("objects/zz")).unwrap();
        std::fs::write(temp.path().join("objects/zz/not-a-key"), b"junk").unwrap();

        let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 150);
        assert_eq!(quota.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_evicts_least_recently_used() {
        let temp = TempDir::new().unwrap();
        let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();

        let old = put_object(temp.path(), &[1u8; 100]);
        let hot = put_object(temp.path(), &[2u8; 100]);
        let new = put_object(temp.path(), &[3u8; 100]);
        for key in [&old, &hot, &new] {
            quota.insert(key, 100).await.unwrap();
        }
        quota.touch(&hot).await.unwrap();

        assert!(quota.cleanup(200).await.unwrap());
        assert!(!object_path(temp.path(), &old).exists());
        assert!(object_path(temp.path(), &hot).exists());
        assert!(object_path(temp.path(), &new).exists());
        assert_eq!(quota.size().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn pinned_objects_survive_cleanup() {
        let temp = TempDir::new().unwrap();
        let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();
        let key = put_object(temp.path(), &[7u8; 64]);
        quota.insert(&key, 64).await.unwrap();
        quota.pin(&key);

        assert!(!quota.cleanup(0).await.unwrap());
        assert!(object_path(temp.path(), &key).exists());

        quota.unpin(&key);
        assert!(quota.cleanup(0).await.unwrap());
        assert!(quota.is_empty());
    }

    #[tokio::test]
    async fn ledger_round_trip_after_clean_shutdown() {
        let temp = TempDir::new().unwrap();
        let key = put_object(temp.path(), &[5u8; 10]);
        {
            let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();
            quota.insert(&key, 10).await.unwrap();
        }
        assert!(temp.path().join(LEDGER_FILE).exists());

        // Object removed behind our back; the ledger still accounts for it.
        std::fs::remove_file(object_path(temp.path(), &key)).unwrap();
        let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 10);
        assert!(!temp.path().join(LEDGER_FILE).exists());
    }

    #[tokio::test]
    async fn ledger_ignored_after_crash() {
        let temp = TempDir::new().unwrap();
        let key = put_object(temp.path(), &[5u8; 10]);
        {
            let quota = DiskQuota::open(config(temp.path(), 1000)).await.unwrap();
            quota.insert(&key, 10).await.unwrap();
        }
        std::fs::remove_file(object_path(temp.path(), &key)).unwrap();

        let mut cfg = config(temp.path(), 1000);
        cfg.had_prior_crash = true;
        let quota = DiskQuota::open(cfg).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 0);
        assert!(!temp.path().join(LEDGER_FILE).exists());
    }

    #[tokio::test]
    async fn shared_mode_sees_foreign_objects() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(temp.path(), 1000);
        cfg.mode = SharingMode::Shared;
        cfg.region_lock = true;
        let quota = DiskQuota::open(cfg).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 0);

        put_object(temp.path(), &[9u8; 300]);
        assert!(quota.cleanup(100).await.unwrap());
        assert_eq!(quota.size().await.unwrap(), 0);
        assert!(temp.path().join(REGION_LOCK_FILE).exists());

        drop(quota);
        assert!(!temp.path().join(LEDGER_FILE).exists());
    }
}
