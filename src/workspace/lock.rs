//! Advisory file locks shared across processes
//!
//! Two flavours: [`WorkspaceLock`] guards a private workspace and removes its
//! lock file on release; [`RegionLock`] guards state shared by several mount
//! processes (shared quota, high-availability identifier store) and leaves the
//! lock file in place.

use crate::error::{StrataError, StrataResult};
use fs2::FileExt as _;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of a lock attempt that did not fail outright
#[derive(Debug)]
pub enum LockAttempt {
    Locked(WorkspaceLock),
    /// Another process holds the lock and the caller did not want to wait
    WouldBlock,
}

impl LockAttempt {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Exclusive lock on `<workspace>/lock.<name>`
#[derive(Debug)]
pub struct WorkspaceLock {
    file: Option<File>,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Try a non-blocking acquisition, escalating to a blocking one when
    /// `blocking` is set and the lock is contended.
    pub async fn acquire(path: &Path, blocking: bool) -> StrataResult<LockAttempt> {
        let file = open_lock_file(path).map_err(|e| lock_failed(path, e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired workspace lock {}", path.display());
                return Ok(LockAttempt::Locked(Self::held(file, path)));
            }
            Err(e) if is_contended(&e) => {}
            Err(e) => return Err(lock_failed(path, e)),
        }

        if !blocking {
            debug!("Workspace lock {} is held elsewhere", path.display());
            // Our handle closes here; the holder's file stays untouched.
            return Ok(LockAttempt::WouldBlock);
        }

        warn!("Waiting for workspace lock {}", path.display());
        let file = lock_on_blocking_thread(file)
            .await
            .map_err(|e| lock_failed(path, e))?;
        debug!("Acquired workspace lock {} after waiting", path.display());
        Ok(LockAttempt::Locked(Self::held(file, path)))
    }

    fn held(file: File, path: &Path) -> Self {
        Self {
            file: Some(file),
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.unlock() {
                debug!("Failed to unlock {}: {}", self.path.display(), e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove lock file {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Exclusive lock scoped to a region shared by several processes.
///
/// Released when dropped; the lock file itself is never removed.
#[derive(Debug)]
pub struct RegionLock {
    file: File,
    path: PathBuf,
}

impl RegionLock {
    /// Block the current thread until the lock is held
    pub fn lock_blocking(path: &Path) -> StrataResult<Self> {
        let file = open_lock_file(path).map_err(|e| region_failed(path, e))?;
        file.lock_exclusive().map_err(|e| region_failed(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Wait for the lock without stalling the async runtime
    pub async fn lock(path: &Path) -> StrataResult<Self> {
        let file = open_lock_file(path).map_err(|e| region_failed(path, e))?;
        let file = lock_on_blocking_thread(file)
            .await
            .map_err(|e| region_failed(path, e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegionLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(false).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

async fn lock_on_blocking_thread(file: File) -> io::Result<File> {
    tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn lock_failed(path: &Path, source: io::Error) -> StrataError {
    StrataError::WorkspaceLockFailed {
        path: path.to_path_buf(),
        source,
    }
}

fn region_failed(path: &Path, source: io::Error) -> StrataError {
    StrataError::io(format!("locking shared region {}", path.display()), source)
}
