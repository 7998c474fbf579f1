//! Error types for strata
//!
//! All modules use `StrataResult<T>` as their return type. Every error maps
//! onto a [`BootStatus`] so the process entry point can turn it into an exit
//! code.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for strata operations
pub type StrataResult<T> = Result<T, StrataError>;

/// Machine-readable outcome of a boot sequence, doubling as process exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootStatus {
    Ok,
    Unknown,
    /// Invalid or contradictory options
    Options,
    /// Workspace or cache directory could not be prepared
    CacheDir,
    /// Quota manager could not be initialized
    Quota,
    /// Stable identifier store failure
    IdMap,
    /// Workspace is locked by another process
    LockWorkspace,
}

impl BootStatus {
    /// Numeric code, stable across releases
    pub fn code(&self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Unknown => 1,
            Self::Options => 2,
            Self::CacheDir => 3,
            Self::Quota => 4,
            Self::IdMap => 5,
            Self::LockWorkspace => 6,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for BootStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Unknown => "unknown",
            Self::Options => "options",
            Self::CacheDir => "cache-dir",
            Self::Quota => "quota",
            Self::IdMap => "idmap",
            Self::LockWorkspace => "lock-workspace",
        };
        write!(f, "{}", name)
    }
}

/// All errors that can occur in strata
#[derive(Error, Debug)]
pub enum StrataError {
    // Configuration errors
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Circular cache definition: {0}")]
    CircularDefinition(String),

    // Workspace errors
    #[error("Cannot create workspace directory {path}: {source}")]
    WorkspaceCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace {0} is locked by another process")]
    WorkspaceBusy(PathBuf),

    #[error("Could not acquire workspace lock {path}: {source}")]
    WorkspaceLockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace {0} is unavailable")]
    WorkspaceUnavailable(PathBuf),

    #[error("Cache {cache} is outside the workspace {workspace}")]
    CacheOutsideWorkspace { cache: PathBuf, workspace: PathBuf },

    // Backend errors
    #[error("Cache backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Cache backend is read-only: {0}")]
    ReadOnly(String),

    #[error("Quota already attached to cache backend {0}")]
    QuotaAlreadyAttached(String),

    #[error("Quota initialization failed: {0}")]
    QuotaInitFailed(String),

    #[error("Invalid content key: {0}")]
    InvalidKey(String),

    #[error("Plugin protocol error: {0}")]
    Protocol(String),

    // Stable identifier store errors
    #[error("Stable identifier store unavailable: {0}")]
    IdMapUnavailable(String),

    #[error("Stable identifier store is corrupt: {0}")]
    IdentityStoreCorrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an invalid configuration error
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Create a backend unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable(reason.into())
    }

    /// Stable machine code for logs and status files
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingConfig(_) => "missing_config",
            Self::InvalidConfig(_) | Self::ConfigInvalid { .. } | Self::TomlParse(_) => {
                "invalid_config"
            }
            Self::CircularDefinition(_) => "circular_definition",
            Self::WorkspaceCreate { .. } => "workspace_create",
            Self::WorkspaceBusy(_) => "workspace_busy",
            Self::WorkspaceLockFailed { .. } => "workspace_lock",
            Self::WorkspaceUnavailable(_) => "workspace_unavailable",
            Self::CacheOutsideWorkspace { .. } => "cache_outside_workspace",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::ReadOnly(_) => "read_only",
            Self::QuotaAlreadyAttached(_) => "quota_attached",
            Self::QuotaInitFailed(_) => "quota_init_failed",
            Self::InvalidKey(_) => "invalid_key",
            Self::Protocol(_) => "protocol",
            Self::IdMapUnavailable(_) => "idmap_unavailable",
            Self::IdentityStoreCorrupt(_) => "identity_store_corrupt",
            Self::Sqlite(_) => "sqlite",
            Self::Io { .. } => "io",
            Self::Json(_) => "json",
            Self::Internal(_) => "internal",
        }
    }

    /// Boot status reported when this error aborts the boot sequence
    pub fn boot_status(&self) -> BootStatus {
        match self {
            Self::MissingConfig(_)
            | Self::InvalidConfig(_)
            | Self::ConfigInvalid { .. }
            | Self::TomlParse(_) => BootStatus::Options,
            Self::CircularDefinition(_)
            | Self::WorkspaceCreate { .. }
            | Self::WorkspaceLockFailed { .. }
            | Self::WorkspaceUnavailable(_)
            | Self::CacheOutsideWorkspace { .. }
            | Self::BackendUnavailable(_)
            | Self::ReadOnly(_)
            | Self::Protocol(_)
            | Self::Io { .. } => BootStatus::CacheDir,
            Self::WorkspaceBusy(_) => BootStatus::LockWorkspace,
            Self::QuotaAlreadyAttached(_) | Self::QuotaInitFailed(_) => BootStatus::Quota,
            Self::IdMapUnavailable(_) | Self::IdentityStoreCorrupt(_) | Self::Sqlite(_) => {
                BootStatus::IdMap
            }
            Self::InvalidKey(_) | Self::Json(_) | Self::Internal(_) => BootStatus::Unknown,
        }
    }

    /// Check if restarting the whole boot sequence may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkspaceBusy(_)
                | Self::WorkspaceLockFailed { .. }
                | Self::WorkspaceUnavailable(_)
                | Self::BackendUnavailable(_)
                | Self::Io { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::WorkspaceBusy(_) => Some("Another mount holds the workspace; pass --wait to queue"),
            Self::CircularDefinition(_) => Some("Check the upper/lower settings of tiered caches"),
            Self::IdMapUnavailable(_) => Some("Wipe the cache directory before enabling export"),
            Self::CacheOutsideWorkspace { .. } => {
                Some("Drop the 'workspace' option so the cache directory holds the identifier store")
            }
            Self::QuotaInitFailed(_) => Some("Free space in the cache or raise cache.quota_limit"),
            _ => None,
        }
    }
}
