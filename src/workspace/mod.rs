//! Workspace coordination
//!
//! A workspace is a per-mount directory holding the lock file, the crash
//! sentinel and, by default, the disk cache. It provides mutual exclusion
//! between processes and crash evidence to everything built on top of it.
//!
//! # Layout
//!
//! | File | Purpose |
//! |------|---------|
//! | `lock.<name>` | exclusive advisory lock, one holder per workspace |
//! | `running.<name>` | crash sentinel, removed on clean shutdown |
//! | `uuid` | instance identifier |
//! | `idmap.<name>/` | stable identifier store (private mode) |

pub mod lock;
pub mod sentinel;

pub use lock::{LockAttempt, RegionLock, WorkspaceLock};
pub use sentinel::CrashSentinel;

use crate::config::{keys, ConfigSource};
use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Cache base used when `cache.base` is not configured
pub const DEFAULT_CACHE_BASE: &str = "/var/lib/strata";

/// Workspace path from options.
///
/// `cache.base` (plus `shared` or the filesystem name) is the classic
/// location; `cache.dir` replaces it and `workspace` overrides both.
pub fn determine_path(options: &dyn ConfigSource, fs_name: &str) -> StrataResult<PathBuf> {
    let base = options
        .value(keys::CACHE_BASE)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_BASE));
    let mut path = if options.flag(keys::CACHE_SHARED) {
        base.join("shared")
    } else {
        base.join(fs_name)
    };

    if let Some(dir) = options.value(keys::CACHE_DIR) {
        if options.is_defined(keys::CACHE_BASE) {
            return Err(StrataError::invalid(
                "'cache.base' and 'cache.dir' are mutually exclusive",
            ));
        }
        path = PathBuf::from(dir);
    }
    if let Some(explicit) = options.value(keys::WORKSPACE) {
        path = PathBuf::from(explicit);
    }
    Ok(path)
}

/// Create `path` and its parents with mode `0770`; idempotent
pub fn ensure_directory(path: &Path) -> StrataResult<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o770);
    }
    builder.create(path).map_err(|e| StrataError::WorkspaceCreate {
        path: path.to_path_buf(),
        source: e,
    })
}

/// A locked workspace directory.
///
/// Fields are dropped top to bottom: the sentinel goes first, then the lock
/// is released and its file unlinked.
#[derive(Debug)]
pub struct Workspace {
    sentinel: Option<CrashSentinel>,
    lock: WorkspaceLock,
    path: PathBuf,
    name: String,
    found_previous_crash: bool,
}

impl Workspace {
    /// Create the directory and take its lock.
    ///
    /// With `wait` unset, a lock held by another process fails fast with
    /// [`StrataError::WorkspaceBusy`].
    pub async fn open(path: &Path, name: &str, wait: bool) -> StrataResult<Self> {
        ensure_directory(path)?;

        let lock_path = path.join(format!("lock.{}", name));
        let lock = match WorkspaceLock::acquire(&lock_path, wait).await? {
            LockAttempt::Locked(lock) => lock,
            LockAttempt::WouldBlock => return Err(StrataError::WorkspaceBusy(path.to_path_buf())),
        };

        debug!("Workspace {} ready", path.display());
        Ok(Self {
            sentinel: None,
            lock,
            path: path.to_path_buf(),
            name: name.to_string(),
            found_previous_crash: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    pub fn sentinel_path(&self) -> PathBuf {
        self.path.join(format!("running.{}", self.name))
    }

    /// Whether any call to [`Self::detect_prior_crash`] found crash evidence
    pub fn found_previous_crash(&self) -> bool {
        self.found_previous_crash
    }

    /// Check for a sentinel left by a previous instance, then (re)create it.
    ///
    /// Returns true only if the sentinel existed and was not created by this
    /// process.
    pub fn detect_prior_crash(&mut self) -> StrataResult<bool> {
        let path = self.sentinel_path();
        let ours = self.sentinel.as_ref().is_some_and(CrashSentinel::is_armed);
        let existed = !ours && path.exists();

        if existed {
            self.found_previous_crash = true;
            warn!("Previous instance on {} did not shut down cleanly", self.path.display());
        }

        match self.sentinel.as_mut() {
            Some(sentinel) => sentinel.rearm()?,
            None => self.sentinel = Some(CrashSentinel::arm(&path)?),
        }
        Ok(existed)
    }

    /// Drop the crash sentinel while the mount continues read-only
    pub fn downgrade_to_read_only(&mut self) {
        if let Some(sentinel) = self.sentinel.as_mut() {
            if sentinel.is_armed() {
                sentinel.disarm();
                info!("Switched workspace {} to read-only mode", self.path.display());
            }
        }
    }

    /// Make the workspace the process working directory
    pub fn enter(&self) -> StrataResult<()> {
        std::env::set_current_dir(&self.path)
            .map_err(|_| StrataError::WorkspaceUnavailable(self.path.clone()))
    }
}
