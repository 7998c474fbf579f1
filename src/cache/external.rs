//! Cache backend served by an external plugin process

use super::plugin::{Locator, PluginConnection};
use super::{BackendKind, CacheBackend, ContentKey, ObjectHandle, Transaction};
use crate::error::{StrataError, StrataResult};
use crate::quota::QuotaPolicy;
use crate::stats::BackendCounters;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct ExternalBackend {
    instance: String,
    plugin: Arc<PluginConnection>,
    /// Ceiling on concurrently open write transactions
    nfiles: u64,
    open_txns: Arc<AtomicU64>,
    read_only: AtomicBool,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: BackendCounters,
}

impl ExternalBackend {
    /// Connect (launching `cmdline` if needed) and complete the handshake
    pub async fn connect(
        instance: &str,
        locator: Locator,
        cmdline: &[String],
        nfiles: u64,
        counters: BackendCounters,
    ) -> StrataResult<Self> {
        let mut plugin = PluginConnection::establish(locator, cmdline).await?;
        plugin.handshake(instance, nfiles).await?;
        info!(
            "External cache '{}' at {} (capabilities: {})",
            instance,
            plugin.locator(),
            if plugin.capabilities().is_empty() {
                "none".to_string()
            } else {
                plugin.capabilities().join(",")
            }
        );

        Ok(Self {
            instance: instance.to_string(),
            plugin: Arc::new(plugin),
            nfiles,
            open_txns: Arc::new(AtomicU64::new(0)),
            read_only: AtomicBool::new(false),
            quota: None,
            counters,
        })
    }

    /// Shared handle to the plugin session, for delegated quota
    pub fn plugin(&self) -> Arc<PluginConnection> {
        self.plugin.clone()
    }

    pub fn nfiles(&self) -> u64 {
        self.nfiles
    }
}

#[async_trait]
impl CacheBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!("external:{}({})", self.instance, self.plugin.locator())
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
        match self.plugin.get(key).await? {
            Some(data) => {
                self.counters.n_hits.inc();
                Ok(Some(ObjectHandle::Buffer(data)))
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
        let reserved = self
            .open_txns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.nfiles).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(StrataError::unavailable(format!(
                "external cache '{}' has {} transactions open",
                self.instance, self.nfiles
            )));
        }

        Ok(Box::new(ExternalTxn {
            key: key.clone(),
            buffer: Vec::new(),
            plugin: self.plugin.clone(),
            slot: TxnSlot(self.open_txns.clone()),
            counters: self.counters.clone(),
        }))
    }

    async fn probe(&self, key: &ContentKey) -> StrataResult<bool> {
        self.plugin.probe(key).await
    }

    fn tear_down_to_read_only(&self) {
        self.read_only.store(true, Ordering::Release);
    }
}

/// Releases a transaction slot when dropped
struct TxnSlot(Arc<AtomicU64>);

impl Drop for TxnSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct ExternalTxn {
    key: ContentKey,
    buffer: Vec<u8>,
    plugin: Arc<PluginConnection>,
    slot: TxnSlot,
    counters: BackendCounters,
}

#[async_trait]
impl Transaction for ExternalTxn {
    fn key(&self) -> &ContentKey {
        &self.key
    }

    async fn write(&mut self, data: &[u8]) -> StrataResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StrataResult<()> {
        let result = self.plugin.put(&self.key, &self.buffer).await;
        match &result {
            Ok(()) => self.counters.n_commits.inc(),
            Err(_) => self.counters.n_write_failures.inc(),
        }
        drop(self.slot);
        result
    }

    async fn abort(self: Box<Self>) -> StrataResult<()> {
        Ok(())
    }
}
