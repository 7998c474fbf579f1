//! Configuration keys understood by strata
//!
//! Global settings live at the top level or under `[cache]`, `[export]`,
//! `[log]` and `[sqlite]`. Named cache instances are configured under
//! `[cache_instance.<name>]`. The `default` instance additionally falls back
//! to the plain `[cache]` keys so that simple setups need no instance table.

use crate::config::ConfigSource;

/// Name of the instance used when `cache.primary` is not set
pub const DEFAULT_INSTANCE: &str = "default";

/// Well-known option keys
pub mod keys {
    pub const WORKSPACE: &str = "workspace";
    pub const NFILES: &str = "nfiles";

    pub const CACHE_PRIMARY: &str = "cache.primary";
    pub const CACHE_BASE: &str = "cache.base";
    pub const CACHE_DIR: &str = "cache.dir";
    pub const CACHE_SHARED: &str = "cache.shared";
    pub const CACHE_RAW_SYMLINKS: &str = "cache.raw_symlinks";

    pub const EXPORT_SOURCE: &str = "export.source";
    pub const EXPORT_SHARED: &str = "export.shared";

    pub const LOG_LEVEL: &str = "log.level";
    pub const LOG_FORMAT: &str = "log.format";
    pub const LOG_FILE: &str = "log.file";

    pub const SQLITE_BUSY_TIMEOUT_MS: &str = "sqlite.busy_timeout_ms";

    // Per-instance parameter names
    pub const TYPE: &str = "type";
    pub const BASE: &str = "base";
    pub const DIR: &str = "dir";
    pub const SHARED: &str = "shared";
    pub const ALIEN: &str = "alien";
    pub const QUOTA_LIMIT: &str = "quota_limit";
    pub const SERVER_MODE: &str = "server_mode";
    pub const SIZE: &str = "size";
    pub const MALLOC: &str = "malloc";
    pub const UPPER: &str = "upper";
    pub const LOWER: &str = "lower";
    pub const LOCATOR: &str = "locator";
    pub const CMDLINE: &str = "cmdline";
}

/// Build the option key of `param` for a cache `instance`.
///
/// `cache_param(opts, "size", "mem")` is `cache_instance.mem.size`. For the
/// default instance, `cache.<param>` is used unless the instance table
/// explicitly defines the parameter.
pub fn cache_param(options: &dyn ConfigSource, param: &str, instance: &str) -> String {
    let scoped = format!("cache_instance.{}.{}", instance, param);
    if instance == DEFAULT_INSTANCE && !options.is_defined(&scoped) {
        return format!("cache.{}", param);
    }
    scoped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    #[test]
    fn named_instance_is_scoped() {
        let options = Options::new();
        assert_eq!(
            cache_param(&options, keys::SIZE, "mem"),
            "cache_instance.mem.size"
        );
    }

    #[test]
    fn default_instance_falls_back_to_cache_table() {
        let options = Options::new().with("cache.shared", "yes");
        assert_eq!(
            cache_param(&options, keys::SHARED, DEFAULT_INSTANCE),
            "cache.shared"
        );
    }

    #[test]
    fn default_instance_prefers_explicit_table() {
        let options = Options::new().with("cache_instance.default.shared", "no");
        assert_eq!(
            cache_param(&options, keys::SHARED, DEFAULT_INSTANCE),
            "cache_instance.default.shared"
        );
    }
}
