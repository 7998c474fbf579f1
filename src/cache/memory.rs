//! In-memory cache backend
//!
//! Holds objects in process memory under a fixed byte budget and an object
//! count ceiling, evicting least recently used objects to make room.

use super::{BackendKind, CacheBackend, ContentKey, ObjectHandle, Transaction};
use crate::error::{StrataError, StrataResult};
use crate::quota::QuotaPolicy;
use crate::stats::BackendCounters;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;
/// Smallest budget a memory cache gets, whatever was configured
pub const MIN_BUDGET: u64 = 200 * MIB;

/// How object memory is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocStrategy {
    /// One allocation per object
    Libc,
    /// Objects packed into one dedicated buffer
    #[default]
    Arena,
}

impl AllocStrategy {
    /// Parse the `malloc` option (`libc` or `heap`)
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "libc" => Some(Self::Libc),
            "heap" => Some(Self::Arena),
            _ => None,
        }
    }
}

impl fmt::Display for AllocStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Libc => write!(f, "libc"),
            Self::Arena => write!(f, "heap"),
        }
    }
}

/// Physical memory of the machine in bytes
pub fn physical_memory() -> u64 {
    // SAFETY: sysconf has no preconditions
    let (pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    pages as u64 * page_size as u64
}

/// Byte budget from the `size` option.
///
/// `N` is MiB, `N%` a share of `physical`; unset means a 32nd of `physical`.
/// The result is at least [`MIN_BUDGET`] and a multiple of 8.
pub fn compute_budget(size: Option<&str>, physical: u64) -> StrataResult<u64> {
    let bytes = match size.map(str::trim) {
        None => physical >> 5,
        Some(value) => {
            let (digits, percent) = match value.strip_suffix('%') {
                Some(digits) => (digits, true),
                None => (value, false),
            };
            let n: u64 = digits
                .trim()
                .parse()
                .map_err(|_| StrataError::invalid(format!("invalid memory cache size '{}'", value)))?;
            if percent {
                physical.saturating_mul(n) / 100
            } else {
                n.saturating_mul(MIB)
            }
        }
    };
    let bytes = bytes.max(MIN_BUDGET);
    Ok(bytes.saturating_add(7) & !7)
}

#[derive(Debug)]
enum Storage {
    Shared(Arc<[u8]>),
    Packed { offset: usize, len: usize },
}

#[derive(Debug)]
struct Slot {
    storage: Storage,
    len: u64,
    seq: u64,
}

#[derive(Debug)]
struct Store {
    budget: u64,
    nfiles: u64,
    strategy: AllocStrategy,
    objects: HashMap<ContentKey, Slot>,
    recency: BTreeMap<u64, ContentKey>,
    arena: Vec<u8>,
    used: u64,
    next_seq: u64,
}

impl Store {
    fn new(budget: u64, nfiles: u64, strategy: AllocStrategy) -> Self {
        Self {
            budget,
            nfiles,
            strategy,
            objects: HashMap::new(),
            recency: BTreeMap::new(),
            arena: Vec::new(),
            used: 0,
            next_seq: 0,
        }
    }

    fn bump(&mut self, key: &ContentKey) -> bool {
        let seq = self.next_seq;
        let Some(slot) = self.objects.get_mut(key) else {
            return false;
        };
        self.recency.remove(&slot.seq);
        slot.seq = seq;
        self.recency.insert(seq, key.clone());
        self.next_seq += 1;
        true
    }

    fn get(&mut self, key: &ContentKey) -> Option<ObjectHandle> {
        if !self.bump(key) {
            return None;
        }
        let slot = self.objects.get(key)?;
        Some(match &slot.storage {
            Storage::Shared(data) => ObjectHandle::Memory(data.clone()),
            Storage::Packed { offset, len } => {
                ObjectHandle::Buffer(self.arena[*offset..*offset + *len].to_vec())
            }
        })
    }

    fn remove(&mut self, key: &ContentKey) -> Option<u64> {
        let slot = self.objects.remove(key)?;
        self.recency.remove(&slot.seq);
        self.used -= slot.len;
        Some(slot.len)
    }

    fn evict_oldest(&mut self) -> Option<(ContentKey, u64)> {
        let (_, key) = self.recency.pop_first()?;
        let slot = self.objects.remove(&key)?;
        self.used -= slot.len;
        Some((key, slot.len))
    }

    fn insert(&mut self, key: ContentKey, data: Vec<u8>) -> StrataResult<Vec<(ContentKey, u64)>> {
        let len = data.len() as u64;
        if len > self.budget {
            return Err(StrataError::unavailable(format!(
                "object {} ({} bytes) exceeds the memory cache budget",
                key, len
            )));
        }
        self.remove(&key);

        let mut evicted = Vec::new();
        while self.used + len > self.budget || self.objects.len() as u64 >= self.nfiles {
            match self.evict_oldest() {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }

        let storage = match self.strategy {
            AllocStrategy::Libc => Storage::Shared(Arc::from(data)),
            AllocStrategy::Arena => {
                if (self.arena.len() + data.len()) as u64 > self.budget {
                    self.compact();
                }
                let offset = self.arena.len();
                self.arena.extend_from_slice(&data);
                Storage::Packed {
                    offset,
                    len: data.len(),
                }
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.recency.insert(seq, key.clone());
        self.objects.insert(key, Slot { storage, len, seq });
        self.used += len;
        Ok(evicted)
    }

    /// Move live packed objects to the front of the arena
    fn compact(&mut self) {
        let mut live: Vec<_> = self
            .objects
            .values_mut()
            .filter_map(|slot| match &mut slot.storage {
                Storage::Packed { offset, len } => Some((offset, *len)),
                Storage::Shared(_) => None,
            })
            .collect();
        live.sort_by_key(|(offset, _)| **offset);

        let mut packed = Vec::with_capacity(self.arena.len());
        for (offset, len) in live {
            let start = packed.len();
            packed.extend_from_slice(&self.arena[*offset..*offset + len]);
            *offset = start;
        }
        debug!(
            "Compacted memory cache arena from {} to {} bytes",
            self.arena.len(),
            packed.len()
        );
        self.arena = packed;
    }
}

#[derive(Debug)]
pub struct MemoryBackend {
    instance: String,
    store: Arc<Mutex<Store>>,
    read_only: AtomicBool,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: BackendCounters,
}

impl MemoryBackend {
    pub fn new(
        instance: &str,
        budget: u64,
        nfiles: u64,
        strategy: AllocStrategy,
        counters: BackendCounters,
    ) -> Self {
        info!(
            "Memory cache '{}' with {} MiB, {} objects max, {} allocation",
            instance,
            budget / MIB,
            nfiles,
            strategy
        );
        Self {
            instance: instance.to_string(),
            store: Arc::new(Mutex::new(Store::new(budget, nfiles, strategy))),
            read_only: AtomicBool::new(false),
            quota: None,
            counters,
        }
    }

    pub fn budget(&self) -> u64 {
        lock(&self.store).budget
    }

    pub fn nfiles(&self) -> u64 {
        lock(&self.store).nfiles
    }

    pub fn strategy(&self) -> AllocStrategy {
        lock(&self.store).strategy
    }

    /// Bytes currently held
    pub fn used(&self) -> u64 {
        lock(&self.store).used
    }

    pub fn len(&self) -> usize {
        lock(&self.store).objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("ram:{}({} MiB)", self.instance, self.budget() / MIB)
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
        let handle = lock(&self.store).get(key);
        match handle {
            Some(handle) => {
                self.counters.n_hits.inc();
                Ok(Some(handle))
            }
            None => {
                self.counters.n_misses.inc();
                Ok(None)
            }
        }
    }

    async fn begin(&self, key: &ContentKey) -> StrataResult<Box<dyn Transaction>> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(StrataError::ReadOnly(self.instance.clone()));
        }
        Ok(Box::new(MemoryTxn {
            key: key.clone(),
            buffer: Vec::new(),
            store: self.store.clone(),
            quota: self.quota.clone(),
            counters: self.counters.clone(),
        }))
    }

    async fn probe(&self, key: &ContentKey) -> StrataResult<bool> {
        Ok(lock(&self.store).objects.contains_key(key))
    }

    fn tear_down_to_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }
}

struct MemoryTxn {
    key: ContentKey,
    buffer: Vec<u8>,
    store: Arc<Mutex<Store>>,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: BackendCounters,
}

#[async_trait]
impl Transaction for MemoryTxn {
    fn key(&self) -> &ContentKey {
        &self.key
    }

    async fn write(&mut self, data: &[u8]) -> StrataResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StrataResult<()> {
        let Self {
            key,
            buffer,
            store,
            quota,
            counters,
        } = *self;
        let size = buffer.len() as u64;
        let evicted = match lock(&store).insert(key.clone(), buffer) {
            Ok(evicted) => evicted,
            Err(e) => {
                counters.n_write_failures.inc();
                return Err(e);
            }
        };
        counters.n_commits.inc();

        if let Some(quota) = quota {
            for (victim, _) in &evicted {
                quota.remove(victim).await?;
            }
            quota.insert(&key, size).await?;
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StrataResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::NoopQuota;

    fn backend(budget: u64, nfiles: u64, strategy: AllocStrategy) -> MemoryBackend {
        MemoryBackend::new("mem", budget, nfiles, strategy, BackendCounters::detached())
    }

    #[test]
    fn budget_defaults_to_fraction_of_memory() {
        let physical = 64 * 1024 * MIB;
        assert_eq!(compute_budget(None, physical).unwrap(), physical / 32);
    }

    #[test]
    fn budget_units_and_floor() {
        let physical = 16 * 1024 * MIB;
        assert_eq!(compute_budget(Some("512"), physical).unwrap(), 512 * MIB);
        assert_eq!(compute_budget(Some("10%"), physical).unwrap(), (physical / 10 + 7) & !7);
        assert_eq!(compute_budget(Some("1"), physical).unwrap(), MIN_BUDGET);
        assert_eq!(compute_budget(None, 1024).unwrap(), MIN_BUDGET);
        assert_eq!(compute_budget(Some("3%"), 1000 * MIB + 1).unwrap() % 8, 0);
    }

    #[test]
    fn budget_rejects_garbage() {
        assert!(compute_budget(Some("lots"), MIB).is_err());
        assert!(compute_budget(Some("%"), MIB).is_err());
    }

    #[test]
    fn alloc_strategy_parse() {
        assert_eq!(AllocStrategy::parse("libc"), Some(AllocStrategy::Libc));
        assert_eq!(AllocStrategy::parse("heap"), Some(AllocStrategy::Arena));
        assert_eq!(AllocStrategy::parse("jemalloc"), None);
        assert_eq!(AllocStrategy::default(), AllocStrategy::Arena);
    }

    #[tokio::test]
    async fn store_and_open_both_strategies() {
        for strategy in [AllocStrategy::Libc, AllocStrategy::Arena] {
            let mem = backend(1024, 16, strategy);
            let key = ContentKey::digest(b"object");
            mem.store(&key, b"object").await.unwrap();
            let handle = mem.open(&key).await.unwrap().unwrap();
            assert_eq!(handle.read_all().await.unwrap(), b"object");
            assert!(mem.probe(&key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let mem = backend(20, 16, AllocStrategy::Arena);
        let a = ContentKey::digest(b"a");
        let b = ContentKey::digest(b"b");
        let c = ContentKey::digest(b"c");
        mem.store(&a, &[1u8; 8]).await.unwrap();
        mem.store(&b, &[2u8; 8]).await.unwrap();
        mem.open(&a).await.unwrap();
        mem.store(&c, &[3u8; 8]).await.unwrap();

        assert!(mem.probe(&a).await.unwrap());
        assert!(!mem.probe(&b).await.unwrap());
        assert!(mem.probe(&c).await.unwrap());
        assert_eq!(mem.used(), 16);
        // arena was compacted instead of growing past the budget
        assert_eq!(
            mem.open(&c).await.unwrap().unwrap().read_all().await.unwrap(),
            vec![3u8; 8]
        );
    }

    #[tokio::test]
    async fn object_ceiling_is_enforced() {
        let mem = backend(1024, 2, AllocStrategy::Libc);
        for i in 0u8..5 {
            mem.store(&ContentKey::digest(&[i]), &[i]).await.unwrap();
        }
        assert_eq!(mem.len(), 2);
    }

    #[tokio::test]
    async fn oversized_object_is_rejected() {
        let mem = backend(4, 16, AllocStrategy::Libc);
        let err = mem.store(&ContentKey::digest(b"big"), b"too big").await.unwrap_err();
        assert!(matches!(err, StrataError::BackendUnavailable(_)));
        assert!(mem.is_empty());
    }

    #[tokio::test]
    async fn quota_bookkeeping_follows_evictions() {
        let mut mem = backend(10, 16, AllocStrategy::Libc);
        let quota = Arc::new(NoopQuota::new());
        mem.attach_quota(quota.clone()).unwrap();
        mem.store(&ContentKey::digest(b"1"), &[0u8; 6]).await.unwrap();
        mem.store(&ContentKey::digest(b"2"), &[0u8; 6]).await.unwrap();
        assert_eq!(quota.size().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn read_only_rejects_begin() {
        let mem = backend(1024, 16, AllocStrategy::Arena);
        mem.tear_down_to_read_only();
        assert!(matches!(
            mem.begin(&ContentKey::digest(b"x")).await,
            Err(StrataError::ReadOnly(_))
        ));
    }
}
