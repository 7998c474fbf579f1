//! Cache backends
//!
//! Content-addressed object storage behind one trait. Objects are immutable
//! once committed; writers go through a transaction that is either committed
//! or aborted.
//!
//! # Backends
//!
//! | Kind | Storage | Quota |
//! |------|---------|-------|
//! | `disk` | files below a cache directory | managed (optional) |
//! | `ram` | process memory, bounded budget | no-op bookkeeping |
//! | `tiered` | `upper` + `lower` child backends | per child |
//! | `external` | out-of-process plugin | delegated to plugin |

pub mod disk;
pub mod external;
pub mod memory;
pub mod plugin;
pub mod tiered;

pub use disk::DiskBackend;
pub use external::ExternalBackend;
pub use memory::{AllocStrategy, MemoryBackend};
pub use tiered::TieredBackend;

use crate::error::{StrataError, StrataResult};
use crate::quota::QuotaPolicy;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

/// Backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Disk,
    Memory,
    Tiered,
    External,
}

impl BackendKind {
    /// Parse the `type` option of a cache instance
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "disk" | "posix" => Some(Self::Disk),
            "ram" | "memory" => Some(Self::Memory),
            "tiered" => Some(Self::Tiered),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disk => "disk",
            Self::Memory => "ram",
            Self::Tiered => "tiered",
            Self::External => "external",
        };
        write!(f, "{}", name)
    }
}

/// Hex digest naming a cache object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentKey(String);

impl ContentKey {
    /// Accepts lowercase or uppercase hex with an even number of digits (at least 4)
    pub fn parse(value: &str) -> StrataResult<Self> {
        if value.len() < 4 || value.len() % 2 != 0 {
            return Err(StrataError::InvalidKey(value.to_string()));
        }
        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StrataError::InvalidKey(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    /// SHA-256 of `data`
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fan-out directory and file name used by on-disk layouts
    pub fn split(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A readable cache object
#[derive(Debug)]
pub enum ObjectHandle {
    /// Open file inside a disk cache
    File { file: tokio::fs::File, size: u64 },
    /// Shared buffer owned by a memory cache
    Memory(Arc<[u8]>),
    /// Buffer fetched from a plugin or a lower tier
    Buffer(Vec<u8>),
}

impl ObjectHandle {
    pub fn size(&self) -> u64 {
        match self {
            Self::File { size, .. } => *size,
            Self::Memory(data) => data.len() as u64,
            Self::Buffer(data) => data.len() as u64,
        }
    }

    /// Read up to `len` bytes starting at `offset`
    pub async fn read_at(&mut self, offset: u64, len: usize) -> StrataResult<Vec<u8>> {
        match self {
            Self::File { file, size } => {
                let len = len.min(size.saturating_sub(offset) as usize);
                let mut data = vec![0u8; len];
                file.seek(std::io::SeekFrom::Start(offset))
                    .await
                    .map_err(|e| StrataError::io("seeking in cached object", e))?;
                let mut filled = 0;
                while filled < len {
                    let n = file
                        .read(&mut data[filled..])
                        .await
                        .map_err(|e| StrataError::io("reading cached object", e))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                data.truncate(filled);
                Ok(data)
            }
            Self::Memory(data) => Ok(slice_at(data, offset, len)),
            Self::Buffer(data) => Ok(slice_at(data, offset, len)),
        }
    }

    /// Read the whole object
    pub async fn read_all(self) -> StrataResult<Vec<u8>> {
        match self {
            Self::File { mut file, size } => {
                let mut data = Vec::with_capacity(size as usize);
                file.read_to_end(&mut data)
                    .await
                    .map_err(|e| StrataError::io("reading cached object", e))?;
                Ok(data)
            }
            Self::Memory(data) => Ok(data.to_vec()),
            Self::Buffer(data) => Ok(data),
        }
    }
}

fn slice_at(data: &[u8], offset: u64, len: usize) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data[start..end].to_vec()
}

/// Write transaction for one object
#[async_trait]
pub trait Transaction: Send {
    fn key(&self) -> &ContentKey;

    async fn write(&mut self, data: &[u8]) -> StrataResult<()>;

    /// Make the object visible to readers
    async fn commit(self: Box<Self>) -> StrataResult<()>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>) -> StrataResult<()>;
}

/// Polymorphic cache storage unit
#[async_trait]
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Configured instance name
    fn instance(&self) -> &str;

    /// One-line description including children, for status output
    fn describe(&self) -> String;

    /// Attach the quota policy; a second attachment is an error
    fn attach_quota(&mut self, quota: Arc<dyn QuotaPolicy>) -> StrataResult<()>;

    fn quota(&self) -> Option<Arc<dyn QuotaPolicy>>;

    /// Open an object for reading; `None` if it is not cached
    async fn open(&self, key: &ContentKey) -> StrataResult<Option<ObjectHandle>>;

    /// Start a write transaction
    async fn begin(&self, key: &ContentKey) -> StrataResult<Box<dyn Transaction>>;

    async fn probe(&self, key: &ContentKey) -> StrataResult<bool>;

    /// Stop accepting writes; reads keep working
    fn tear_down_to_read_only(&self) {}

    /// Directory of a disk-backed cache
    fn disk_path(&self) -> Option<&Path> {
        None
    }

    /// Whether the storage is managed by someone else (alien cache)
    fn is_alien(&self) -> bool {
        false
    }

    /// Write a complete object in one transaction
    async fn store(&self, key: &ContentKey, data: &[u8]) -> StrataResult<()> {
        let mut txn = self.begin(key).await?;
        if let Err(e) = txn.write(data).await {
            if let Err(abort) = txn.abort().await {
                warn!("Could not abort transaction for {}: {}", key, abort);
            }
            return Err(e);
        }
        txn.commit().await
    }
}
