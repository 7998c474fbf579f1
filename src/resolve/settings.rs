//! Per-kind backend settings read from configuration
//!
//! Everything here is pure: settings are determined and checked without
//! touching the filesystem.

use crate::cache::plugin::Locator;
use crate::cache::AllocStrategy;
use crate::cache::memory::compute_budget;
use crate::config::{cache_param, is_on, keys, ConfigSource};
use crate::context::{FsKind, MountContext};
use crate::error::{StrataError, StrataResult};
use crate::workspace::DEFAULT_CACHE_BASE;
use std::path::PathBuf;

/// Quota limit of mounted disk caches when none is configured, in MiB
pub const DEFAULT_QUOTA_LIMIT_MIB: u64 = 1024;
/// Object ceiling when `nfiles` is not configured
pub const DEFAULT_NFILES: u64 = 8192;

const MIB: u64 = 1024 * 1024;

/// Global `nfiles`
pub fn nfiles(options: &dyn ConfigSource) -> StrataResult<u64> {
    match options.value(keys::NFILES) {
        None => Ok(DEFAULT_NFILES),
        Some(value) => match value.trim().parse::<u64>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(StrataError::invalid(format!(
                "'{}' must be a positive number, got '{}'",
                keys::NFILES,
                value
            ))),
        },
    }
}

fn instance_flag(options: &dyn ConfigSource, param: &str, instance: &str) -> bool {
    options
        .value(&cache_param(options, param, instance))
        .map(|v| is_on(&v))
        .unwrap_or(false)
}

/// Settings of a disk backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSettings {
    pub path: PathBuf,
    pub shared: bool,
    pub alien: bool,
    pub avoid_rename: bool,
    /// Bytes; 0 means unmanaged
    pub quota_limit: u64,
    pub base_defined: bool,
    pub dir_defined: bool,
}

impl DiskSettings {
    /// Collect the settings of `instance`; see [`Self::check`] for validation
    pub fn determine(
        options: &dyn ConfigSource,
        instance: &str,
        ctx: &MountContext,
    ) -> StrataResult<Self> {
        let shared = instance_flag(options, keys::SHARED, instance);
        let avoid_rename = instance_flag(options, keys::SERVER_MODE, instance);

        let mut quota_limit = match ctx.kind {
            FsKind::Mount => DEFAULT_QUOTA_LIMIT_MIB * MIB,
            FsKind::Library => 0,
        };
        let limit_key = cache_param(options, keys::QUOTA_LIMIT, instance);
        if let Some(value) = options.value(&limit_key) {
            let mib: i64 = value.trim().parse().map_err(|_| {
                StrataError::invalid(format!("'{}' is not a number: '{}'", limit_key, value))
            })?;
            quota_limit = u64::try_from(mib).unwrap_or(0).saturating_mul(MIB);
        }

        let base = options.value(&cache_param(options, keys::BASE, instance));
        let base_defined = base.is_some();
        let mut path = PathBuf::from(base.unwrap_or_else(|| DEFAULT_CACHE_BASE.to_string()));
        if shared {
            path.push("shared");
        } else {
            path.push(&ctx.fs_name);
        }

        let dir = options.value(&cache_param(options, keys::DIR, instance));
        let dir_defined = dir.is_some();
        if let Some(dir) = dir {
            path = PathBuf::from(dir);
        }
        let alien = options.value(&cache_param(options, keys::ALIEN, instance));
        let is_alien = alien.is_some();
        if let Some(alien) = alien {
            path = PathBuf::from(alien);
        }

        Ok(Self {
            path,
            shared,
            alien: is_alien,
            avoid_rename,
            quota_limit,
            base_defined,
            dir_defined,
        })
    }

    pub fn is_managed(&self) -> bool {
        self.quota_limit > 0
    }

    /// Reject contradictory combinations
    pub fn check(&self, kind: FsKind) -> StrataResult<()> {
        if self.alien && self.shared {
            return Err(StrataError::invalid(
                "shared local disk cache and alien cache are mutually exclusive",
            ));
        }
        if self.alien && self.is_managed() {
            return Err(StrataError::invalid(
                "quota management and alien cache are mutually exclusive",
            ));
        }
        if kind == FsKind::Library && (self.shared || self.is_managed()) {
            return Err(StrataError::invalid(
                "library mode supports only unmanaged exclusive or alien caches",
            ));
        }
        if self.base_defined && self.dir_defined {
            return Err(StrataError::invalid("'base' and 'dir' are mutually exclusive"));
        }
        Ok(())
    }
}

/// Settings of a memory backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySettings {
    /// Bytes
    pub budget: u64,
    pub nfiles: u64,
    pub strategy: AllocStrategy,
}

impl MemorySettings {
    pub fn determine(
        options: &dyn ConfigSource,
        instance: &str,
        physical_memory: u64,
    ) -> StrataResult<Self> {
        let size = options.value(&cache_param(options, keys::SIZE, instance));
        let budget = compute_budget(size.as_deref(), physical_memory)?;

        let malloc_key = cache_param(options, keys::MALLOC, instance);
        let strategy = match options.value(&malloc_key) {
            None => AllocStrategy::default(),
            Some(value) => AllocStrategy::parse(&value).ok_or_else(|| {
                StrataError::invalid(format!("unknown malloc {}={}", malloc_key, value))
            })?,
        };

        Ok(Self {
            budget,
            nfiles: nfiles(options)?,
            strategy,
        })
    }
}

/// Settings of an external backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSettings {
    pub locator: Locator,
    pub cmdline: Vec<String>,
    pub nfiles: u64,
}

impl ExternalSettings {
    pub fn determine(options: &dyn ConfigSource, instance: &str) -> StrataResult<Self> {
        let locator_key = cache_param(options, keys::LOCATOR, instance);
        let locator = options
            .value(&locator_key)
            .ok_or(StrataError::MissingConfig(locator_key))?;
        let cmdline = options
            .value(&cache_param(options, keys::CMDLINE, instance))
            .map(|line| {
                line.split(',')
                    .map(str::trim)
                    .filter(|arg| !arg.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            locator: Locator::parse(&locator)?,
            cmdline,
            nfiles: nfiles(options)?,
        })
    }
}
