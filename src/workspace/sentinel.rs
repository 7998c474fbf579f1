//! Crash sentinel: `<workspace>/running.<name>`
//!
//! Present while a process uses the workspace read-write. Finding it at
//! startup means the previous instance never shut down cleanly.

use crate::error::{StrataError, StrataResult};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug)]
pub struct CrashSentinel {
    path: PathBuf,
    armed: bool,
}

impl CrashSentinel {
    /// Create (or reuse) the sentinel file and take responsibility for removing it
    pub fn arm(path: &Path) -> StrataResult<Self> {
        touch(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            armed: true,
        })
    }

    /// Make sure the file exists again after a downgrade or external removal
    pub fn rearm(&mut self) -> StrataResult<()> {
        touch(&self.path)?;
        self.armed = true;
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Remove the sentinel; safe to call repeatedly
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Failed to remove sentinel {}: {}", self.path.display(), e);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CrashSentinel {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn touch(path: &Path) -> StrataResult<()> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .map(drop)
        .map_err(|e| StrataError::io(format!("creating running sentinel {}", path.display()), e))
}
