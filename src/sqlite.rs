//! SQLite settings and the read-only catalog shim
//!
//! Catalogs are SQLite databases stored as ordinary cache objects. The shim
//! opens them read-only straight out of the root backend, materializing them
//! into a temporary file when the backend does not keep objects on disk.

use crate::cache::disk::object_path;
use crate::cache::{BackendKind, CacheBackend, ContentKey};
use crate::config::{keys, ConfigSource};
use crate::error::{StrataError, StrataResult};
use rusqlite::{Connection, OpenFlags};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Connection settings shared by every database the subsystem opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteSettings {
    pub busy_timeout: Duration,
}

impl Default for SqliteSettings {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl SqliteSettings {
    pub fn from_options(options: &dyn ConfigSource) -> StrataResult<Self> {
        let Some(value) = options.value(keys::SQLITE_BUSY_TIMEOUT_MS) else {
            return Ok(Self::default());
        };
        let ms: u64 = value.trim().parse().map_err(|_| {
            StrataError::invalid(format!(
                "'{}' must be a number of milliseconds, got '{}'",
                keys::SQLITE_BUSY_TIMEOUT_MS,
                value
            ))
        })?;
        Ok(Self {
            busy_timeout: Duration::from_millis(ms),
        })
    }

    pub fn apply(&self, conn: &Connection) -> StrataResult<()> {
        conn.busy_timeout(self.busy_timeout)?;
        Ok(())
    }
}

/// A catalog opened through the shim
pub struct Catalog {
    conn: Connection,
    // Keeps the materialized copy alive as long as the connection
    _backing: Option<NamedTempFile>,
}

impl Catalog {
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("path", &self.conn.path())
            .finish()
    }
}

/// Read-only access to catalogs held by the root backend
#[derive(Debug)]
pub struct SqliteShim {
    backend: Arc<dyn CacheBackend>,
    settings: SqliteSettings,
}

impl SqliteShim {
    pub fn register(backend: Arc<dyn CacheBackend>, settings: SqliteSettings) -> Self {
        debug!("Catalog access registered against {}", backend.describe());
        Self { backend, settings }
    }

    pub fn settings(&self) -> SqliteSettings {
        self.settings
    }

    /// Open the catalog stored under `key`; `None` if it is not cached
    pub async fn open_catalog(&self, key: &ContentKey) -> StrataResult<Option<Catalog>> {
        if self.backend.kind() == BackendKind::Disk {
            if let Some(root) = self.backend.disk_path() {
                let path = object_path(root, key);
                let exists = tokio::fs::try_exists(&path)
                    .await
                    .map_err(|e| StrataError::io(format!("probing {}", path.display()), e))?;
                if !exists {
                    return Ok(None);
                }
                let conn = self.open_read_only(&path)?;
                return Ok(Some(Catalog {
                    conn,
                    _backing: None,
                }));
            }
        }

        let Some(handle) = self.backend.open(key).await? else {
            return Ok(None);
        };
        let data = handle.read_all().await?;
        let backing = tokio::task::spawn_blocking(move || materialize(&data))
            .await
            .map_err(|e| StrataError::Internal(format!("catalog copy task failed: {}", e)))?
            .map_err(|e| StrataError::io(format!("materializing catalog {}", key), e))?;
        let conn = self.open_read_only(backing.path())?;
        Ok(Some(Catalog {
            conn,
            _backing: Some(backing),
        }))
    }

    fn open_read_only(&self, path: &Path) -> StrataResult<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        self.settings.apply(&conn)?;
        Ok(conn)
    }
}

fn materialize(data: &[u8]) -> std::io::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(data)?;
    file.flush()?;
    Ok(file)
}
