//! Quota policies
//!
//! A quota policy bounds the storage footprint of one backend. It is built
//! after its backend exists, reconciled against what is already on disk, and
//! attached exactly once.

pub mod delegated;
pub mod disk;

pub use delegated::DelegatedQuota;
pub use disk::{DiskQuota, DiskQuotaConfig};

use crate::cache::ContentKey;
use crate::error::{StrataError, StrataResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info};

/// Whether several mount processes share the accounted region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    Exclusive,
    Shared,
}

impl fmt::Display for SharingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exclusive => write!(f, "exclusive"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// Accounting and eviction contract of a quota-managed backend
#[async_trait]
pub trait QuotaPolicy: Send + Sync + fmt::Debug {
    /// Short name for status output
    fn name(&self) -> &'static str;

    fn mode(&self) -> SharingMode {
        SharingMode::Exclusive
    }

    async fn capacity(&self) -> StrataResult<u64>;

    /// Cleanup target once capacity is exceeded
    async fn threshold(&self) -> StrataResult<u64> {
        Ok(self.capacity().await? / 2)
    }

    /// Currently occupied bytes
    async fn size(&self) -> StrataResult<u64>;

    async fn insert(&self, key: &ContentKey, size: u64) -> StrataResult<()>;

    /// Mark an object as recently used
    async fn touch(&self, key: &ContentKey) -> StrataResult<()>;

    async fn remove(&self, key: &ContentKey) -> StrataResult<()>;

    /// Evict until at most `leave_size` bytes remain; false if that is not possible
    async fn cleanup(&self, leave_size: u64) -> StrataResult<bool>;
}

/// Format bytes as human-readable size (e.g., "1.5 GB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Bring a freshly opened quota below its capacity before it is handed out.
///
/// A cache that is already beyond capacity is cleaned down to the threshold;
/// failing to get there is fatal.
pub async fn enforce_startup_quota(quota: &dyn QuotaPolicy) -> StrataResult<()> {
    let size = quota.size().await?;
    let capacity = quota.capacity().await?;
    if size <= capacity {
        return Ok(());
    }

    let threshold = quota.threshold().await?;
    info!(
        "Cache is already beyond quota size (size: {}, capacity: {}), cleaning up",
        format_bytes(size),
        format_bytes(capacity)
    );
    let cleaned = quota
        .cleanup(threshold)
        .await
        .map_err(|e| StrataError::QuotaInitFailed(format!("cleanup failed: {}", e)))?;
    let remaining = quota.size().await?;
    if !cleaned || remaining > threshold {
        return Err(StrataError::QuotaInitFailed(format!(
            "failed to clean up cache ({} bytes left, threshold {})",
            remaining, threshold
        )));
    }
    debug!("Cache cleaned up to {}", format_bytes(remaining));
    Ok(())
}

/// Stand-in for backends whose capacity is bounded by construction
#[derive(Debug, Default)]
pub struct NoopQuota {
    sizes: Mutex<HashMap<ContentKey, u64>>,
}

impl NoopQuota {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaPolicy for NoopQuota {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn capacity(&self) -> StrataResult<u64> {
        Ok(u64::MAX)
    }

    async fn size(&self) -> StrataResult<u64> {
        let sizes = self.sizes.lock().unwrap_or_else(|p| p.into_inner());
        Ok(sizes.values().sum())
    }

    async fn insert(&self, key: &ContentKey, size: u64) -> StrataResult<()> {
        self.sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.clone(), size);
        Ok(())
    }

    async fn touch(&self, _key: &ContentKey) -> StrataResult<()> {
        Ok(())
    }

    async fn remove(&self, key: &ContentKey) -> StrataResult<()> {
        self.sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }

    async fn cleanup(&self, _leave_size: u64) -> StrataResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Quota whose cleanup frees a fixed amount
    #[derive(Debug)]
    struct FakeQuota {
        capacity: u64,
        size: AtomicU64,
        frees: u64,
        cleanups: AtomicU64,
    }

    #[async_trait]
    impl QuotaPolicy for FakeQuota {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn capacity(&self) -> StrataResult<u64> {
            Ok(self.capacity)
        }
        async fn size(&self) -> StrataResult<u64> {
            Ok(self.size.load(Ordering::SeqCst))
        }
        async fn insert(&self, _key: &ContentKey, _size: u64) -> StrataResult<()> {
            Ok(())
        }
        async fn touch(&self, _key: &ContentKey) -> StrataResult<()> {
            Ok(())
        }
        async fn remove(&self, _key: &ContentKey) -> StrataResult<()> {
            Ok(())
        }
        async fn cleanup(&self, leave_size: u64) -> StrataResult<bool> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            let now = self.size.load(Ordering::SeqCst).saturating_sub(self.frees);
            self.size.store(now, Ordering::SeqCst);
            Ok(now <= leave_size)
        }
    }

    fn fake(capacity: u64, size: u64, frees: u64) -> FakeQuota {
        FakeQuota {
            capacity,
            size: AtomicU64::new(size),
            frees,
            cleanups: AtomicU64::new(0),
        }
    }

    #[tokio::test]
    async fn under_capacity_is_left_alone() {
        let quota = fake(100, 80, 80);
        enforce_startup_quota(&quota).await.unwrap();
        assert_eq!(quota.cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(quota.size().await.unwrap(), 80);
    }

    #[tokio::test]
    async fn over_capacity_cleans_to_threshold() {
        let quota = fake(100, 150, 120);
        enforce_startup_quota(&quota).await.unwrap();
        assert_eq!(quota.cleanups.load(Ordering::SeqCst), 1);
        assert!(quota.size().await.unwrap() <= 50);
    }

    #[tokio::test]
    async fn insufficient_cleanup_is_fatal() {
        let quota = fake(100, 150, 10);
        let err = enforce_startup_quota(&quota).await.unwrap_err();
        assert!(matches!(err, StrataError::QuotaInitFailed(_)));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(1024 * 1024 * 3 / 2), "1.5 MB");
    }

    #[tokio::test]
    async fn noop_quota_tracks_sizes() {
        let quota = NoopQuota::new();
        let key = ContentKey::digest(b"x");
        quota.insert(&key, 10).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 10);
        quota.remove(&key).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 0);
        assert!(quota.cleanup(0).await.unwrap());
        assert_eq!(quota.capacity().await.unwrap(), u64::MAX);
    }
}
