//! Disk cache backend
//!
//! Objects live in `objects/<first two hex digits>/<rest>`. Writers stage into
//! `txn/` and rename into place on commit, so readers never see partial
//! objects.

use super::{BackendKind, CacheBackend, ContentKey, ObjectHandle, Transaction};
use crate::error::{StrataError, StrataResult};
use crate::quota::QuotaPolicy;
use crate::stats::BackendCounters;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const OBJECTS_DIR: &str = "objects";
pub const TXN_DIR: &str = "txn";
/// Marks a directory as a strata cache
pub const MARKER_FILE: &str = ".stratacache";

/// Location of `key` below a cache directory
pub fn object_path(root: &Path, key: &ContentKey) -> PathBuf {
    let (bucket, rest) = key.split();
    root.join(OBJECTS_DIR).join(bucket).join(rest)
}

/// Construction parameters of a [`DiskBackend`]
#[derive(Debug, Clone)]
pub struct DiskOptions {
    pub path: PathBuf,
    /// Directory is managed by someone else; no quota, best-effort metadata
    pub alien: bool,
    /// Shared between several mount processes
    pub shared: bool,
    /// Copy instead of rename on commit (server mode, some network filesystems)
    pub avoid_rename: bool,
}

#[derive(Debug)]
pub struct DiskBackend {
    instance: String,
    options: DiskOptions,
    read_only: AtomicBool,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: BackendCounters,
}

impl DiskBackend {
    /// Prepare the directory layout and discard transactions left by a previous run
    pub async fn create(
        instance: &str,
        options: DiskOptions,
        counters: BackendCounters,
    ) -> StrataResult<Self> {
        for dir in [OBJECTS_DIR, TXN_DIR] {
            let path = options.path.join(dir);
            match fs::create_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if options.alien && fs::metadata(&options.path).await.is_ok() => {
                    warn!("Could not create {} in alien cache: {}", path.display(), e);
                }
                Err(e) => {
                    return Err(StrataError::io(format!("creating {}", path.display()), e));
                }
            }
        }

        // Other processes may be writing into a shared or alien txn directory.
        if !options.shared && !options.alien {
            let purged = purge_directory(&options.path.join(TXN_DIR)).await?;
            if purged > 0 {
                debug!("Removed {} stale transactions", purged);
            }
        }

        info!(
            "Disk cache '{}' at {}{}",
            instance,
            options.path.display(),
            if options.alien { " (alien)" } else { "" }
        );
        Ok(Self {
            instance: instance.to_string(),
            options,
            read_only: AtomicBool::new(false),
            quota: None,
            counters,
        })
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    pub fn is_shared(&self) -> bool {
        self.options.shared
    }

    /// Write the cache marker; failures only warn on alien caches
    pub async fn write_marker(&self) -> StrataResult<()> {
        let path = self.options.path.join(MARKER_FILE);
        match fs::write(&path, b"strata cache\n").await {
            Ok(()) => Ok(()),
            Err(e) if self.options.alien => {
                warn!("Could not write cache marker {}: {}", path.display(), e);
                Ok(())
            }
            Err(e) => Err(StrataError::io(format!("writing {}", path.display()), e)),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CacheBackend for DiskBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Disk
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        let mut flags = Vec::new();
        if self.options.shared {
            flags.push("shared");
        }
        if self.options.alien {
            flags.push("alien");
        }
        if self.quota.is_some() {
            flags.push("managed");
        }
        if flags.is_empty() {
            format!("disk:{}({})", self.instance, self.options.path.display())
        } else {
            format!(
                "disk:{}({}; {})",
                self.instance,
                self.options.path.display(),
                flags.join(",")
            )
        }
    }

    fn attach_quota(&mut self, quota: Arc<dyn QuotaPolicy>) -> StrataResult<()> {
        if self.quota.is_some() {
            return Err(StrataError::QuotaAlreadyAttached(self.instance.clone()));
        }
        self.quota = Some(quota);
        Ok(())
    }

    fn quota(&self) -> Option<Arc<dyn QuotaPolicy>> {
        self.quota.clone()
    }

    async fn open(&self, key: &ContentKey) -> StrataResult<Option<ObjectHandle>> {
        let path = object_path(&self.options.path, key);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.counters.n_misses.inc();
                return Ok(None);
            }
            Err(e) => return Err(StrataError::io(format!("opening {}", path.display()), e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| StrataError::io(format!("inspecting {}", path.display()), e))?
            .len();

        if let Some(quota) = &self.quota {
            quota.touch(key).await?;
        }
        self.counters.n_hits.inc();
        Ok(Some(ObjectHandle::File { file, size }))
    }

    async fn begin(&self, key: &ContentKey) -> StrataResult<Box<dyn Transaction>> {
        if self.is_read_only() {
            return Err(StrataError::ReadOnly(self.instance.clone()));
        }
        let tmp_path = self
            .options
            .path
            .join(TXN_DIR)
            .join(format!("{}.{}", key, Uuid::new_v4().simple()));
        let file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| StrataError::io(format!("creating {}", tmp_path.display()), e))?;

        Ok(Box::new(DiskTxn {
            key: key.clone(),
            final_path: object_path(&self.options.path, key),
            tmp_path,
            file: Some(file),
            written: 0,
            avoid_rename: self.options.avoid_rename,
            quota: self.quota.clone(),
            counters: self.counters.clone(),
            finished: false,
        }))
    }

    async fn probe(&self, key: &ContentKey) -> StrataResult<bool> {
        let path = object_path(&self.options.path, key);
        fs::try_exists(&path)
            .await
            .map_err(|e| StrataError::io(format!("probing {}", path.display()), e))
    }

    fn tear_down_to_read_only(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            info!("Disk cache '{}' switched to read-only", self.instance);
        }
    }

    fn disk_path(&self) -> Option<&Path> {
        Some(&self.options.path)
    }

    fn is_alien(&self) -> bool {
        self.options.alien
    }
}

struct DiskTxn {
    key: ContentKey,
    final_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<fs::File>,
    written: u64,
    avoid_rename: bool,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: BackendCounters,
    finished: bool,
}

impl DiskTxn {
    async fn publish(&mut self) -> StrataResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| StrataError::io("flushing cache object", e))?;
            file.sync_all()
                .await
                .map_err(|e| StrataError::io("syncing cache object", e))?;
        }
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::io(format!("creating {}", parent.display()), e))?;
        }

        if self.avoid_rename {
            fs::copy(&self.tmp_path, &self.final_path)
                .await
                .map_err(|e| StrataError::io(format!("copying into {}", self.final_path.display()), e))?;
            let _ = fs::remove_file(&self.tmp_path).await;
        } else {
            fs::rename(&self.tmp_path, &self.final_path)
                .await
                .map_err(|e| StrataError::io(format!("renaming into {}", self.final_path.display()), e))?;
        }
        self.finished = true;

        if let Some(quota) = &self.quota {
            quota.insert(&self.key, self.written).await?;
            if quota.size().await? > quota.capacity().await? {
                let threshold = quota.threshold().await?;
                if !quota.cleanup(threshold).await? {
                    warn!("Cache cleanup could not reach {} bytes", threshold);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transaction for DiskTxn {
    fn key(&self) -> &ContentKey {
        &self.key
    }

    async fn write(&mut self, data: &[u8]) -> StrataResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| StrataError::Internal("write after commit".into()))?;
        file.write_all(data)
            .await
            .map_err(|e| StrataError::io(format!("writing {}", self.tmp_path.display()), e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> StrataResult<()> {
        match self.publish().await {
            Ok(()) => {
                self.counters.n_commits.inc();
                Ok(())
            }
            Err(e) => {
                self.counters.n_write_failures.inc();
                Err(e)
            }
        }
    }

    async fn abort(mut self: Box<Self>) -> StrataResult<()> {
        self.file = None;
        self.finished = true;
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(format!("removing {}", self.tmp_path.display()), e)),
        }
    }
}

impl Drop for DiskTxn {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

async fn purge_directory(dir: &Path) -> StrataResult<usize> {
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?;
    let mut purged = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StrataError::io(format!("reading {}", dir.display()), e))?
    {
        if fs::remove_file(entry.path()).await.is_ok() {
            purged += 1;
        }
    }
    Ok(purged)
}
