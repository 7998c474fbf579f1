//! Per-mount context shared by the boot stages

use crate::config::{keys, ConfigSource};
use std::fmt;

/// How the filesystem is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// Kernel mount; owns the process working directory
    Mount,
    /// Embedded in another process
    Library,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mount => write!(f, "mount"),
            Self::Library => write!(f, "library"),
        }
    }
}

/// Settings that used to be process-wide flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountContext {
    pub fs_name: String,
    pub kind: FsKind,
    /// Hand symlink targets to consumers without variable expansion
    pub raw_symlinks: bool,
    /// Owner reported for files
    pub uid: u32,
    pub gid: u32,
}

impl MountContext {
    pub fn new(fs_name: &str, kind: FsKind) -> Self {
        // SAFETY: geteuid/getegid cannot fail
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };
        Self {
            fs_name: fs_name.to_string(),
            kind,
            raw_symlinks: false,
            uid,
            gid,
        }
    }

    pub fn from_options(fs_name: &str, kind: FsKind, options: &dyn ConfigSource) -> Self {
        Self {
            raw_symlinks: options.flag(keys::CACHE_RAW_SYMLINKS),
            ..Self::new(fs_name, kind)
        }
    }

    pub fn is_mount(&self) -> bool {
        self.kind == FsKind::Mount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    #[test]
    fn raw_symlinks_from_options() {
        let options = Options::new().with("cache.raw_symlinks", "on");
        let ctx = MountContext::from_options("repo", FsKind::Library, &options);
        assert!(ctx.raw_symlinks);
        assert!(!ctx.is_mount());
        assert_eq!(ctx.fs_name, "repo");
        assert_eq!(FsKind::Mount.to_string(), "mount");
    }
}
