//! Backend resolution
//!
//! Turns a named cache instance into a backend object graph in two passes:
//!
//! 1. Planning reads and validates configuration into a [`BackendSpec`] tree,
//!    detecting circular definitions. Nothing is touched on disk.
//! 2. Building constructs the backends bottom-up and attaches quota policies.
//!
//! A configuration error therefore never leaves half-built caches behind.

pub mod settings;

pub use settings::{DiskSettings, ExternalSettings, MemorySettings};

use crate::cache::disk::DiskOptions;
use crate::cache::memory::physical_memory;
use crate::cache::tiered::TieredCounters;
use crate::cache::{
    BackendKind, CacheBackend, DiskBackend, ExternalBackend, MemoryBackend, TieredBackend,
};
use crate::config::{cache_param, keys, ConfigSource, DEFAULT_INSTANCE};
use crate::context::MountContext;
use crate::error::{StrataError, StrataResult};
use crate::quota::{
    enforce_startup_quota, DelegatedQuota, DiskQuota, DiskQuotaConfig, NoopQuota, SharingMode,
};
use crate::stats::{BackendCounters, Statistics, StatisticsTemplate};
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_INSTANCE_NAME: usize = 24;

/// Name of the root instance (`cache.primary`)
pub fn primary_instance(options: &dyn ConfigSource) -> String {
    options
        .value(keys::CACHE_PRIMARY)
        .unwrap_or_else(|| DEFAULT_INSTANCE.to_string())
}

/// Backend kind configured for `instance`
pub fn instance_kind(options: &dyn ConfigSource, instance: &str) -> StrataResult<BackendKind> {
    if instance == DEFAULT_INSTANCE {
        return Ok(BackendKind::Disk);
    }
    let key = cache_param(options, keys::TYPE, instance);
    let value = options
        .value(&key)
        .ok_or_else(|| StrataError::MissingConfig(key.clone()))?;
    BackendKind::parse(&value).ok_or_else(|| {
        StrataError::invalid(format!(
            "invalid cache type for '{}': {}",
            instance, value
        ))
    })
}

/// Instance names end up in option keys: 1 to 24 of `[A-Za-z0-9_]`
pub fn check_instance_name(instance: &str) -> StrataResult<()> {
    let valid = !instance.is_empty()
        && instance.len() <= MAX_INSTANCE_NAME
        && instance
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StrataError::invalid(format!(
            "invalid instance name ({}), only characters a-z, A-Z, 0-9, _ are allowed",
            instance
        )))
    }
}

/// Validated description of a backend tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSpec {
    Disk {
        instance: String,
        settings: DiskSettings,
    },
    Memory {
        instance: String,
        settings: MemorySettings,
    },
    Tiered {
        instance: String,
        upper: Box<BackendSpec>,
        lower: Box<BackendSpec>,
    },
    External {
        instance: String,
        settings: ExternalSettings,
    },
}

impl BackendSpec {
    pub fn instance(&self) -> &str {
        match self {
            Self::Disk { instance, .. }
            | Self::Memory { instance, .. }
            | Self::Tiered { instance, .. }
            | Self::External { instance, .. } => instance,
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Disk { .. } => BackendKind::Disk,
            Self::Memory { .. } => BackendKind::Memory,
            Self::Tiered { .. } => BackendKind::Tiered,
            Self::External { .. } => BackendKind::External,
        }
    }
}

/// Configuration pass with cycle detection
pub struct Planner<'a> {
    options: &'a dyn ConfigSource,
    ctx: &'a MountContext,
    physical_memory: u64,
    in_progress: BTreeSet<String>,
}

impl<'a> Planner<'a> {
    pub fn new(options: &'a dyn ConfigSource, ctx: &'a MountContext, physical_memory: u64) -> Self {
        Self {
            options,
            ctx,
            physical_memory,
            in_progress: BTreeSet::new(),
        }
    }

    /// Plan `instance` and, recursively, everything it refers to
    pub fn plan(&mut self, instance: &str) -> StrataResult<BackendSpec> {
        if !self.in_progress.insert(instance.to_string()) {
            return Err(StrataError::CircularDefinition(instance.to_string()));
        }
        let result = self.plan_instance(instance);
        self.in_progress.remove(instance);
        result
    }

    fn plan_instance(&mut self, instance: &str) -> StrataResult<BackendSpec> {
        check_instance_name(instance)?;
        let kind = instance_kind(self.options, instance)?;
        debug!("Planning cache instance {} ({})", instance, kind);

        let spec = match kind {
            BackendKind::Disk => {
                let settings = DiskSettings::determine(self.options, instance, self.ctx)?;
                settings.check(self.ctx.kind)?;
                BackendSpec::Disk {
                    instance: instance.to_string(),
                    settings,
                }
            }
            BackendKind::Memory => BackendSpec::Memory {
                instance: instance.to_string(),
                settings: MemorySettings::determine(self.options, instance, self.physical_memory)?,
            },
            BackendKind::Tiered => {
                let upper = self.child(keys::UPPER, instance)?;
                let upper = self.plan(&upper)?;
                let lower = self.child(keys::LOWER, instance)?;
                let lower = self.plan(&lower)?;
                BackendSpec::Tiered {
                    instance: instance.to_string(),
                    upper: Box::new(upper),
                    lower: Box::new(lower),
                }
            }
            BackendKind::External => BackendSpec::External {
                instance: instance.to_string(),
                settings: ExternalSettings::determine(self.options, instance)?,
            },
        };
        Ok(spec)
    }

    fn child(&self, param: &str, instance: &str) -> StrataResult<String> {
        let key = cache_param(self.options, param, instance);
        self.options
            .value(&key)
            .ok_or(StrataError::MissingConfig(key))
    }
}

/// Builds backend graphs for one filesystem
pub struct Resolver<'a> {
    options: &'a dyn ConfigSource,
    ctx: &'a MountContext,
    workspace: PathBuf,
    statistics: Arc<Statistics>,
    found_previous_crash: bool,
    physical_memory: u64,
}

impl<'a> Resolver<'a> {
    pub fn new(
        options: &'a dyn ConfigSource,
        ctx: &'a MountContext,
        workspace: &Path,
        statistics: Arc<Statistics>,
    ) -> Self {
        Self {
            options,
            ctx,
            workspace: workspace.to_path_buf(),
            statistics,
            found_previous_crash: false,
            physical_memory: physical_memory(),
        }
    }

    /// Managed quotas distrust their saved index after a crash
    pub fn with_previous_crash(mut self, found: bool) -> Self {
        self.found_previous_crash = found;
        self
    }

    pub fn with_physical_memory(mut self, bytes: u64) -> Self {
        self.physical_memory = bytes;
        self
    }

    /// Validate the configuration of `instance` without constructing anything
    pub fn plan(&self, instance: &str) -> StrataResult<BackendSpec> {
        Planner::new(self.options, self.ctx, self.physical_memory).plan(instance)
    }

    /// Plan, then build the backend graph rooted at `instance`
    pub async fn resolve(&self, instance: &str) -> StrataResult<Box<dyn CacheBackend>> {
        let spec = self.plan(instance)?;
        let backend = self.build(spec).await?;
        info!("Cache: {}", backend.describe());
        Ok(backend)
    }

    /// Construct a planned backend tree
    pub fn build(&self, spec: BackendSpec) -> BoxFuture<'_, StrataResult<Box<dyn CacheBackend>>> {
        async move {
            let backend: Box<dyn CacheBackend> = match spec {
                BackendSpec::Disk { instance, settings } => {
                    Box::new(self.build_disk(&instance, settings).await?)
                }
                BackendSpec::Memory { instance, settings } => {
                    let mut memory = MemoryBackend::new(
                        &instance,
                        settings.budget,
                        settings.nfiles,
                        settings.strategy,
                        BackendCounters::register(&self.template(&instance)),
                    );
                    memory.attach_quota(Arc::new(NoopQuota::new()))?;
                    Box::new(memory)
                }
                BackendSpec::Tiered {
                    instance,
                    upper,
                    lower,
                } => {
                    let upper = self.build(*upper).await?;
                    let lower = self.build(*lower).await?;
                    Box::new(TieredBackend::new(
                        &instance,
                        upper,
                        lower,
                        TieredCounters::register(&self.template(&instance)),
                    ))
                }
                BackendSpec::External { instance, settings } => {
                    let mut external = ExternalBackend::connect(
                        &format!("{}:{}", self.ctx.fs_name, instance),
                        settings.locator,
                        &settings.cmdline,
                        settings.nfiles,
                        BackendCounters::register(&self.template(&instance)),
                    )
                    .await?;
                    let plugin = external.plugin();
                    external.attach_quota(Arc::new(DelegatedQuota::new(plugin)))?;
                    Box::new(external)
                }
            };
            Ok(backend)
        }
        .boxed()
    }

    async fn build_disk(&self, instance: &str, settings: DiskSettings) -> StrataResult<DiskBackend> {
        let options = DiskOptions {
            path: settings.path.clone(),
            alien: settings.alien,
            shared: settings.shared,
            avoid_rename: settings.avoid_rename,
        };
        let counters = BackendCounters::register(&self.template(instance));
        let mut disk = DiskBackend::create(instance, options, counters)
            .await
            .map_err(|e| {
                StrataError::unavailable(format!(
                    "failed to set up disk cache '{}' in {}: {}",
                    instance,
                    settings.path.display(),
                    e
                ))
            })?;
        disk.write_marker().await?;

        if settings.is_managed() {
            let mode = if settings.shared {
                SharingMode::Shared
            } else {
                SharingMode::Exclusive
            };
            // Exclusive caches outside the workspace are not covered by its lock.
            let region_lock = settings.shared || !same_path(&settings.path, &self.workspace);
            let quota = DiskQuota::open(DiskQuotaConfig {
                cache_path: settings.path.clone(),
                capacity: settings.quota_limit,
                mode,
                region_lock,
                had_prior_crash: self.found_previous_crash,
            })
            .await
            .map_err(|e| StrataError::QuotaInitFailed(e.to_string()))?;
            enforce_startup_quota(&quota).await?;
            disk.attach_quota(Arc::new(quota))?;
        }
        Ok(disk)
    }

    fn template(&self, instance: &str) -> StatisticsTemplate {
        StatisticsTemplate::new(format!("cache.{}", instance), self.statistics.clone())
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::disk::object_path;
    use crate::cache::ContentKey;
    use crate::config::Options;
    use crate::context::FsKind;
    use tempfile::TempDir;

    const PHYSICAL: u64 = 8 << 30;

    fn mount() -> MountContext {
        MountContext::new("repo", FsKind::Mount)
    }

    #[test]
    fn instance_names() {
        assert!(check_instance_name("default").is_ok());
        assert!(check_instance_name("Tier_2").is_ok());
        assert!(check_instance_name("").is_err());
        assert!(check_instance_name("has-dash").is_err());
        assert!(check_instance_name(&"x".repeat(25)).is_err());
        assert!(check_instance_name(&"x".repeat(24)).is_ok());
    }

    #[test]
    fn kind_lookup() {
        let options = Options::new()
            .with("cache_instance.mem.type", "ram")
            .with("cache_instance.odd.type", "nfs");
        assert_eq!(instance_kind(&options, "default").unwrap(), BackendKind::Disk);
        assert_eq!(instance_kind(&options, "mem").unwrap(), BackendKind::Memory);
        assert!(matches!(
            instance_kind(&options, "odd"),
            Err(StrataError::InvalidConfig(_))
        ));
        assert!(matches!(
            instance_kind(&options, "none"),
            Err(StrataError::MissingConfig(ref k)) if k == "cache_instance.none.type"
        ));
        assert_eq!(primary_instance(&options), "default");
    }

    #[test]
    fn cycle_is_detected_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let lower_dir = temp.path().join("lower");
        let options = Options::new()
            .with("cache_instance.a.type", "tiered")
            .with("cache_instance.a.upper", "b")
            .with("cache_instance.a.lower", "disk")
            .with("cache_instance.b.type", "tiered")
            .with("cache_instance.b.upper", "a")
            .with("cache_instance.b.lower", "disk")
            .with("cache_instance.disk.type", "posix")
            .with("cache_instance.disk.dir", lower_dir.to_str().unwrap());
        let ctx = mount();

        let err = Planner::new(&options, &ctx, PHYSICAL).plan("a").unwrap_err();
        assert!(matches!(err, StrataError::CircularDefinition(ref name) if name == "a"));
        assert!(!lower_dir.exists());
    }

    #[test]
    fn self_reference_is_circular() {
        let options = Options::new()
            .with("cache_instance.loop.type", "tiered")
            .with("cache_instance.loop.upper", "loop")
            .with("cache_instance.loop.lower", "loop");
        let ctx = mount();
        let err = Planner::new(&options, &ctx, PHYSICAL).plan("loop").unwrap_err();
        assert!(matches!(err, StrataError::CircularDefinition(_)));
    }

    #[test]
    fn tiered_requires_upper_and_lower() {
        let options = Options::new().with("cache_instance.t.type", "tiered");
        let ctx = mount();
        let err = Planner::new(&options, &ctx, PHYSICAL).plan("t").unwrap_err();
        assert!(matches!(err, StrataError::MissingConfig(ref k) if k == "cache_instance.t.upper"));

        let options = options.with("cache_instance.t.upper", "default");
        let err = Planner::new(&options, &ctx, PHYSICAL).plan("t").unwrap_err();
        assert!(matches!(err, StrataError::MissingConfig(ref k) if k == "cache_instance.t.lower"));
    }

    #[tokio::test]
    async fn tiered_memory_over_fresh_disk() {
        let temp = TempDir::new().unwrap();
        let options = Options::new()
            .with("cache_instance.tiers.type", "tiered")
            .with("cache_instance.tiers.upper", "mem")
            .with("cache_instance.tiers.lower", "disk")
            .with("cache_instance.mem.type", "ram")
            .with("cache_instance.disk.type", "disk")
            .with("cache_instance.disk.dir", temp.path().join("lower").to_str().unwrap())
            .with("cache_instance.disk.quota_limit", "0");
        let ctx = mount();
        let stats = Arc::new(Statistics::new());
        let resolver = Resolver::new(&options, &ctx, temp.path(), stats.clone())
            .with_physical_memory(PHYSICAL);

        let cache = resolver.resolve("tiers").await.unwrap();
        assert_eq!(cache.kind(), BackendKind::Tiered);

        let absent = ContentKey::digest(b"absent");
        assert!(cache.open(&absent).await.unwrap().is_none());

        let key = ContentKey::digest(b"content");
        cache.store(&key, b"content").await.unwrap();
        let data = cache.open(&key).await.unwrap().unwrap().read_all().await.unwrap();
        assert_eq!(data, b"content");
        assert_eq!(stats.lookup("cache.mem.n_hits").unwrap().get(), 1);
        assert_eq!(stats.lookup("cache.disk.n_hits").unwrap().get(), 0);
        assert!(temp.path().join("lower").join(".stratacache").exists());
    }

    #[tokio::test]
    async fn base_and_dir_rejected_before_disk_is_touched() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("base");
        let dir = temp.path().join("dir");
        let options = Options::new()
            .with("cache.base", base.to_str().unwrap())
            .with("cache.dir", dir.to_str().unwrap());
        let ctx = mount();
        let resolver = Resolver::new(&options, &ctx, temp.path(), Arc::new(Statistics::new()));

        let err = resolver.resolve("default").await.unwrap_err();
        assert!(matches!(err, StrataError::InvalidConfig(_)));
        assert!(!base.exists());
        assert!(!dir.exists());
    }

    fn fill(dir: &Path, count: u8, size: usize) {
        for i in 0..count {
            let data = vec![i; size];
            let path = object_path(dir, &ContentKey::digest(&data));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
    }

    #[tokio::test]
    async fn oversized_cache_is_cleaned_on_attach() {
        let temp = TempDir::new().unwrap();
        fill(temp.path(), 3, 1024 * 1024);
        let options = Options::new()
            .with("cache.dir", temp.path().to_str().unwrap())
            .with("cache.quota_limit", "2");
        let ctx = mount();
        let resolver = Resolver::new(&options, &ctx, temp.path(), Arc::new(Statistics::new()));

        let cache = resolver.resolve("default").await.unwrap();
        let quota = cache.quota().unwrap();
        assert_eq!(quota.capacity().await.unwrap(), 2 * 1024 * 1024);
        assert!(quota.size().await.unwrap() <= quota.threshold().await.unwrap());
        assert_eq!(quota.mode(), SharingMode::Exclusive);
    }

    #[tokio::test]
    async fn single_oversized_object_is_evicted() {
        let temp = TempDir::new().unwrap();
        fill(temp.path(), 1, 3 * 1024 * 1024);
        let options = Options::new()
            .with("cache.dir", temp.path().to_str().unwrap())
            .with("cache.quota_limit", "2");
        let ctx = mount();
        let resolver = Resolver::new(&options, &ctx, temp.path(), Arc::new(Statistics::new()));

        let cache = resolver.resolve("default").await.unwrap();
        assert_eq!(cache.quota().unwrap().size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_gets_noop_quota() {
        let temp = TempDir::new().unwrap();
        let options = Options::new()
            .with("cache.primary", "mem")
            .with("cache_instance.mem.type", "ram")
            .with("cache_instance.mem.size", "300");
        let ctx = mount();
        let resolver = Resolver::new(&options, &ctx, temp.path(), Arc::new(Statistics::new()));
        let cache = resolver.resolve(&primary_instance(&options)).await.unwrap();
        assert_eq!(cache.kind(), BackendKind::Memory);
        assert_eq!(cache.quota().unwrap().name(), "noop");
        assert_eq!(cache.describe(), "ram:mem(300 MiB)");
    }

    #[tokio::test]
    async fn external_without_plugin_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let socket = temp.path().join("none.sock");
        let options = Options::new()
            .with("cache_instance.ext.type", "external")
            .with("cache_instance.ext.locator", format!("unix={}", socket.display()));
        let ctx = mount();
        let resolver = Resolver::new(&options, &ctx, temp.path(), Arc::new(Statistics::new()));
        let err = resolver.resolve("ext").await.unwrap_err();
        assert!(matches!(err, StrataError::BackendUnavailable(_)));
    }
}
