//! Bootstrap sequencer
//!
//! [`FileSystem::create`] runs the boot stages in order and never fails
//! outright: the returned object carries a [`BootStatus`] and a message, and
//! only a filesystem with [`BootStatus::Ok`] is usable.

use crate::cache::{BackendKind, CacheBackend};
use crate::config::{keys, ConfigSource};
use crate::context::{FsKind, MountContext};
use crate::error::{BootStatus, StrataError, StrataResult};
use crate::identity::InstanceIdentity;
use crate::idmap::{store_dir_name, IdMap, IdMapOptions};
use crate::logging::{self, LogSettings};
use crate::resolve::{instance_kind, primary_instance, Resolver};
use crate::sqlite::{SqliteSettings, SqliteShim};
use crate::stats::{Counter, Statistics};
use crate::workspace::{self, Workspace};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Log directive used when `log.level` is not configured
pub const DEFAULT_LOG_DIRECTIVE: &str = "strata=info";

/// Inputs of a boot sequence
#[derive(Clone)]
pub struct FileSystemInfo {
    pub name: String,
    pub kind: FsKind,
    pub options: Arc<dyn ConfigSource>,
    /// Queue behind another holder of the workspace instead of failing
    pub wait_workspace: bool,
    /// Stable identifiers below this number are never allocated
    pub reserved_inode_floor: u64,
}

impl FileSystemInfo {
    pub fn new(name: &str, kind: FsKind, options: Arc<dyn ConfigSource>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            options,
            wait_workspace: false,
            reserved_inode_floor: 0,
        }
    }
}

/// Stable identifier export settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportMode {
    pub enabled: bool,
    /// Shared location of the identifier store (high availability)
    pub shared: Option<PathBuf>,
}

impl ExportMode {
    pub fn from_options(options: &dyn ConfigSource) -> Self {
        Self {
            enabled: options.flag(keys::EXPORT_SOURCE),
            shared: options.value(keys::EXPORT_SHARED).map(PathBuf::from),
        }
    }
}

/// Marker left in disk caches used without an identifier store
pub fn no_idmap_sentinel(cache_path: &Path, fs_name: &str) -> PathBuf {
    cache_path.join(format!("no_idmap.{}", fs_name))
}

#[derive(Debug, Clone)]
struct FsCounters {
    previous_crash: Counter,
    n_downgrades: Counter,
}

impl FsCounters {
    fn register(statistics: &Statistics) -> Self {
        Self {
            previous_crash: statistics
                .register("fs.previous_crash", "Previous instance did not shut down cleanly"),
            n_downgrades: statistics.register("fs.n_downgrades", "Switches to read-only mode"),
        }
    }
}

/// A booted (or failed) filesystem.
///
/// Fields drop top to bottom: catalog shim, identifier store, root backend,
/// workspace, statistics.
pub struct FileSystem {
    shim: Option<SqliteShim>,
    idmap: Option<IdMap>,
    root: Option<Arc<dyn CacheBackend>>,
    workspace: Option<Workspace>,
    statistics: Arc<Statistics>,
    counters: Option<FsCounters>,
    identity: Option<InstanceIdentity>,
    context: MountContext,
    sqlite: SqliteSettings,
    export: ExportMode,
    status: BootStatus,
    error: String,
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("name", &self.context.fs_name)
            .field("kind", &self.context.kind)
            .field("status", &self.status)
            .field("error", &self.error)
            .field("root", &self.root.as_ref().map(|r| r.describe()))
            .finish()
    }
}

impl FileSystem {
    /// Run the boot sequence; inspect [`Self::boot_status`] afterwards
    pub async fn create(info: FileSystemInfo) -> Self {
        let mut fs = Self {
            shim: None,
            idmap: None,
            root: None,
            workspace: None,
            statistics: Arc::new(Statistics::new()),
            counters: None,
            identity: None,
            context: MountContext::from_options(&info.name, info.kind, info.options.as_ref()),
            sqlite: SqliteSettings::default(),
            export: ExportMode::from_options(info.options.as_ref()),
            status: BootStatus::Ok,
            error: String::new(),
        };

        if let Err(e) = fs.boot(&info).await {
            error!("Failed to boot {}: {}", info.name, e);
            fs.status = e.boot_status();
            fs.error = e.to_string();
        }
        fs
    }

    async fn boot(&mut self, info: &FileSystemInfo) -> StrataResult<()> {
        let options = info.options.as_ref();

        let log = LogSettings::from_options(options, DEFAULT_LOG_DIRECTIVE)?;
        logging::init(&log)?;
        info!("Booting {} ({})", info.name, info.kind);

        self.counters = Some(FsCounters::register(&self.statistics));
        self.sqlite = SqliteSettings::from_options(options)?;
        self.check_export(options)?;

        let path = workspace::determine_path(options, &info.name)?;
        let mut ws = Workspace::open(&path, &info.name, info.wait_workspace).await?;
        if self.context.is_mount() {
            ws.enter()?;
        }
        ws.detect_prior_crash()?;
        let found_previous_crash = ws.found_previous_crash();
        if found_previous_crash {
            if let Some(counters) = &self.counters {
                counters.previous_crash.set(1);
            }
        }
        let ws = self.workspace.insert(ws);
        let ws_path = ws.path().to_path_buf();

        let primary = primary_instance(options);
        let root = Resolver::new(options, &self.context, &ws_path, self.statistics.clone())
            .with_previous_crash(found_previous_crash)
            .resolve(&primary)
            .await?;
        let root: Arc<dyn CacheBackend> = Arc::from(root);
        self.root = Some(root.clone());

        self.identity = Some(InstanceIdentity::load_or_create(&ws_path).await);

        self.setup_idmap(root.as_ref(), &ws_path, found_previous_crash, info.reserved_inode_floor)
            .await?;

        self.shim = Some(SqliteShim::register(root, self.sqlite));
        info!("{} is ready, workspace {}", info.name, ws_path.display());
        Ok(())
    }

    fn check_export(&self, options: &dyn ConfigSource) -> StrataResult<()> {
        if !self.export.enabled {
            return Ok(());
        }
        if self.context.kind == FsKind::Library {
            return Err(StrataError::invalid(
                "stable identifier export is not available in library mode",
            ));
        }
        let primary = primary_instance(options);
        if instance_kind(options, &primary)? != BackendKind::Disk {
            return Err(StrataError::invalid(format!(
                "stable identifier export requires a disk primary cache, '{}' is not",
                primary
            )));
        }
        Ok(())
    }

    async fn setup_idmap(
        &mut self,
        root: &dyn CacheBackend,
        ws_path: &Path,
        found_previous_crash: bool,
        reserved_floor: u64,
    ) -> StrataResult<()> {
        let fs_name = self.context.fs_name.clone();
        let cache_path = match (root.kind(), root.disk_path()) {
            (BackendKind::Disk, Some(path)) => Some(path.to_path_buf()),
            _ => None,
        };

        if !self.export.enabled {
            if let Some(cache_path) = cache_path {
                let sentinel = no_idmap_sentinel(&cache_path, &fs_name);
                match tokio::fs::write(&sentinel, b"").await {
                    Ok(()) => debug!("Marked {} as used without identifier store", cache_path.display()),
                    Err(e) if root.is_alien() => {
                        warn!("Could not write {}: {}", sentinel.display(), e)
                    }
                    Err(e) => {
                        return Err(StrataError::io(format!("writing {}", sentinel.display()), e))
                    }
                }
            }
            return Ok(());
        }

        let Some(cache_path) = cache_path else {
            return Err(StrataError::invalid(
                "stable identifier export requires a disk primary cache",
            ));
        };
        // The store is only safe under the workspace lock
        if !same_directory(&cache_path, ws_path) {
            return Err(StrataError::CacheOutsideWorkspace {
                cache: cache_path,
                workspace: ws_path.to_path_buf(),
            });
        }
        if no_idmap_sentinel(&cache_path, &fs_name).exists() {
            return Err(StrataError::IdMapUnavailable(format!(
                "cache {} was used without identifier store, wipe the cache",
                cache_path.display()
            )));
        }

        let (dir, high_availability) = match &self.export.shared {
            Some(shared) => (shared.join(store_dir_name(&fs_name)), true),
            None => (ws_path.join(store_dir_name(&fs_name)), false),
        };
        let options = IdMapOptions {
            dir,
            reserved_floor,
            had_prior_crash: found_previous_crash,
            high_availability,
            sqlite: self.sqlite,
        };
        let idmap = tokio::task::spawn_blocking(move || IdMap::open(options))
            .await
            .map_err(|e| StrataError::Internal(format!("identifier store task failed: {}", e)))??;
        self.idmap = Some(idmap);
        Ok(())
    }

    pub fn boot_status(&self) -> BootStatus {
        self.status
    }

    /// Empty when the boot succeeded
    pub fn boot_error(&self) -> &str {
        &self.error
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    pub fn name(&self) -> &str {
        &self.context.fs_name
    }

    pub fn context(&self) -> &MountContext {
        &self.context
    }

    pub fn root(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.root.as_ref()
    }

    pub fn workspace(&self) -> Option<&Workspace> {
        self.workspace.as_ref()
    }

    pub fn idmap(&self) -> Option<&IdMap> {
        self.idmap.as_ref()
    }

    pub fn catalogs(&self) -> Option<&SqliteShim> {
        self.shim.as_ref()
    }

    pub fn identity(&self) -> Option<&InstanceIdentity> {
        self.identity.as_ref()
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn found_previous_crash(&self) -> bool {
        self.workspace
            .as_ref()
            .is_some_and(Workspace::found_previous_crash)
    }

    /// Stop writing to caches and drop crash evidence; reads keep working
    pub fn tear_down_to_read_only(&mut self) {
        if let Some(root) = &self.root {
            root.tear_down_to_read_only();
        }
        if let Some(ws) = self.workspace.as_mut() {
            ws.downgrade_to_read_only();
        }
        if let Some(counters) = &self.counters {
            counters.n_downgrades.inc();
        }
        info!("{} switched to read-only", self.context.fs_name);
    }
}

fn same_directory(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
