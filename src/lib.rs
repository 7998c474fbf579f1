//! strata - storage layer bootstrap for content-addressed network filesystems
//!
//! Resolves named cache backend configurations into a backend tree, attaches
//! eviction policy, coordinates processes sharing an on-disk workspace and
//! keeps a stable-identifier store consistent across restarts.

pub mod boot;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod idmap;
pub mod logging;
pub mod quota;
pub mod resolve;
pub mod sqlite;
pub mod stats;
pub mod workspace;

pub use boot::{FileSystem, FileSystemInfo};
pub use error::{BootStatus, StrataError, StrataResult};
