//! Two-level cache composition
//!
//! Reads try the upper tier first and fall back to the lower tier, copying
//! hits up. Writes go to both tiers concurrently. A write succeeds when at
//! least one tier stored the object; a tier that failed is logged and counted
//! in `n_partial_writes`.

use super::{BackendKind, CacheBackend, ContentKey, ObjectHandle, Transaction};
use crate::error::{StrataError, StrataResult};
use crate::quota::QuotaPolicy;
use crate::stats::{BackendCounters, Counter, StatisticsTemplate};
use async_trait::async_trait;
use futures_util::future::join;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counters of a tiered backend
#[derive(Debug, Clone)]
pub struct TieredCounters {
    pub base: BackendCounters,
    pub n_copy_up: Counter,
    pub n_partial_writes: Counter,
}

impl TieredCounters {
    pub fn register(template: &StatisticsTemplate) -> Self {
        Self {
            base: BackendCounters::register(template),
            n_copy_up: template.register("n_copy_up", "Objects copied from lower to upper tier"),
            n_partial_writes: template
                .register("n_partial_writes", "Writes that reached only one tier"),
        }
    }

    pub fn detached() -> Self {
        Self {
            base: BackendCounters::detached(),
            n_copy_up: Counter::default(),
            n_partial_writes: Counter::default(),
        }
    }
}

#[derive(Debug)]
pub struct TieredBackend {
    instance: String,
    upper: Box<dyn CacheBackend>,
    lower: Box<dyn CacheBackend>,
    quota: Option<Arc<dyn QuotaPolicy>>,
    counters: TieredCounters,
}

impl TieredBackend {
    pub fn new(
        instance: &str,
        upper: Box<dyn CacheBackend>,
        lower: Box<dyn CacheBackend>,
        counters: TieredCounters,
    ) -> Self {
        debug!(
            "Tiered cache '{}': {} over {}",
            instance,
            upper.instance(),
            lower.instance()
        );
        Self {
            instance: instance.to_string(),
            upper,
            lower,
            quota: None,
            counters,
        }
    }

    pub fn upper(&self) -> &dyn CacheBackend {
        self.upper.as_ref()
    }

    pub fn lower(&self) -> &dyn CacheBackend {
        self.lower.as_ref()
    }

    async fn copy_up(&self, key: &ContentKey, data: &[u8]) {
        match self.upper.store(key, data).await {
            Ok(()) => self.counters.n_copy_up.inc(),
            Err(StrataError::ReadOnly(_)) => {}
            Err(e) => debug!("Copy-up of {} into '{}' failed: {}", key, self.upper.instance(), e),
        }
    }
}

#[async_trait]
impl CacheBackend for TieredBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Tiered
    }

    fn instance(&self) -> &str {
        &self.instance
    }

    fn describe(&self) -> String {
        format!(
            "tiered:{}[upper={}, lower={}]",
            self.instance,
            self.upper.describe(),
            self.lower.describe()
        )
    }

    fn attach_quota(&mut self, quota: Arc<dyn QuotaPolicy>) -> StrataResult<()> {
        if self.quota.is_some() {
            return Err(StrataError::QuotaAlreadyAttached(self.instance.clone()));
        }
        self.quota = Some(quota);
        Ok(())
    }

    /// Own quota if one was attached, otherwise the upper tier's
    fn quota(&self) -> Option<Arc<dyn QuotaPolicy>> {
        self.quota.clone().or_else(|| self.upper.quota())
    }

    async fn open(&self, key: &ContentKey) -> StrataResult<Option<ObjectHandle>> {
        if let Some(handle) = self.upper.open(key).await? {
            self.counters.base.n_hits.inc();
            return Ok(Some(handle));
        }
        let Some(handle) = self.lower.open(key).await? else {
            self.counters.base.n_misses.inc();
            return Ok(None);
        };

        self.counters.base.n_hits.inc();
        let data = handle.read_all().await?;
        self.copy_up(key, &data).await;
        Ok(Some(ObjectHandle::Buffer(data)))
    }

    async fn begin(&self, key: &ContentKey) -> StrataResult<Box<dyn Transaction>> {
        let (upper, lower) = join(self.upper.begin(key), self.lower.begin(key)).await;
        let mut txn = TieredTxn {
            key: key.clone(),
            upper: None,
            lower: None,
            partial: false,
            counters: self.counters.clone(),
        };
        match (upper, lower) {
            (Ok(u), Ok(l)) => {
                txn.upper = Some(u);
                txn.lower = Some(l);
            }
            (Ok(u), Err(e)) => {
                warn!("Lower tier '{}' refused write: {}", self.lower.instance(), e);
                txn.upper = Some(u);
                txn.partial = true;
            }
            (Err(e), Ok(l)) => {
                warn!("Upper tier '{}' refused write: {}", self.upper.instance(), e);
                txn.lower = Some(l);
                txn.partial = true;
            }
            (Err(e), Err(_)) => {
                self.counters.base.n_write_failures.inc();
                return Err(e);
            }
        }
        Ok(Box::new(txn))
    }

    async fn probe(&self, key: &ContentKey) -> StrataResult<bool> {
        if self.upper.probe(key).await? {
            return Ok(true);
        }
        self.lower.probe(key).await
    }

    fn tear_down_to_read_only(&self) {
        self.upper.tear_down_to_read_only();
        self.lower.tear_down_to_read_only();
    }
}

struct TieredTxn {
    key: ContentKey,
    upper: Option<Box<dyn Transaction>>,
    lower: Option<Box<dyn Transaction>>,
    partial: bool,
    counters: TieredCounters,
}

impl TieredTxn {
    fn is_empty(&self) -> bool {
        self.upper.is_none() && self.lower.is_none()
    }
}

/// Write into one tier; a failing tier is aborted and dropped
async fn write_tier(tier: &mut Option<Box<dyn Transaction>>, data: &[u8]) -> Option<StrataError> {
    let txn = tier.as_mut()?;
    let err = txn.write(data).await.err()?;
    if let Some(txn) = tier.take() {
        let _ = txn.abort().await;
    }
    Some(err)
}

async fn commit_tier(tier: Option<Box<dyn Transaction>>) -> Option<StrataResult<()>> {
    match tier {
        Some(txn) => Some(txn.commit().await),
        None => None,
    }
}

async fn abort_tier(tier: Option<Box<dyn Transaction>>) -> StrataResult<()> {
    match tier {
        Some(txn) => txn.abort().await,
        None => Ok(()),
    }
}

#[async_trait]
impl Transaction for TieredTxn {
    fn key(&self) -> &ContentKey {
        &self.key
    }

    async fn write(&mut self, data: &[u8]) -> StrataResult<()> {
        let (upper, lower) = join(
            write_tier(&mut self.upper, data),
            write_tier(&mut self.lower, data),
        )
        .await;
        for err in [upper, lower].into_iter().flatten() {
            warn!("Tier write for {} failed: {}", self.key, err);
            self.partial = true;
            if self.is_empty() {
                self.counters.base.n_write_failures.inc();
                return Err(err);
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StrataResult<()> {
        let Self {
            key,
            upper,
            lower,
            mut partial,
            counters,
        } = *self;
        let (upper, lower) = join(commit_tier(upper), commit_tier(lower)).await;

        let mut committed = 0;
        let mut first_error = None;
        for result in [upper, lower].into_iter().flatten() {
            match result {
                Ok(()) => committed += 1,
                Err(e) => {
                    warn!("Tier commit for {} failed: {}", key, e);
                    partial = true;
                    first_error.get_or_insert(e);
                }
            }
        }

        if committed == 0 {
            counters.base.n_write_failures.inc();
            return Err(first_error
                .unwrap_or_else(|| StrataError::Internal(format!("no tier accepted {}", key))));
        }
        if partial {
            counters.n_partial_writes.inc();
        }
        counters.base.n_commits.inc();
        Ok(())
    }

    async fn abort(self: Box<Self>) -> StrataResult<()> {
        let Self { upper, lower, .. } = *self;
        let (upper, lower) = join(abort_tier(upper), abort_tier(lower)).await;
        upper.and(lower)
    }
}
