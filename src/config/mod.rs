//! Configuration management for strata
//!
//! The subsystem never interprets configuration files itself beyond loading
//! them into a flat key/value [`Options`] map. Everything downstream talks to
//! the [`ConfigSource`] trait, so embedders can supply their own provider.

pub mod schema;

pub use schema::{cache_param, keys, DEFAULT_INSTANCE};

use crate::error::{StrataError, StrataResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Generic key/value configuration provider
pub trait ConfigSource: Send + Sync {
    /// Raw value of `key`, if set
    fn value(&self, key: &str) -> Option<String>;

    /// Whether `key` is set at all
    fn is_defined(&self, key: &str) -> bool {
        self.value(key).is_some()
    }

    /// Interpret a value as a boolean switch
    fn is_on(&self, value: &str) -> bool {
        is_on(value)
    }

    /// Convenience: `key` is set and switched on
    fn flag(&self, key: &str) -> bool {
        self.value(key).map(|v| self.is_on(&v)).unwrap_or(false)
    }
}

/// Boolean interpretation shared by all providers
pub fn is_on(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "on" | "1" | "true"
    )
}

/// Flat option map, keys are dotted paths (`cache_instance.mem.size`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    values: BTreeMap<String, String>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Parse a TOML document and flatten nested tables into dotted keys
    pub fn from_toml_str(content: &str) -> StrataResult<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut options = Self::new();
        flatten_into(&mut options.values, None, &table);
        Ok(options)
    }

    /// Dump all options, one `key=value` per line
    pub fn dump(&self) -> String {
        self.values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl ConfigSource for Options {
    fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

fn flatten_into(out: &mut BTreeMap<String, String>, prefix: Option<&str>, table: &toml::Table) {
    for (key, value) in table {
        let full = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key.clone(),
        };
        match value {
            toml::Value::Table(inner) => flatten_into(out, Some(&full), inner),
            toml::Value::String(s) => {
                out.insert(full, s.clone());
            }
            toml::Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                out.insert(full, joined);
            }
            other => {
                out.insert(full, other.to_string());
            }
        }
    }
}

/// Loads option files from disk
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("strata.toml")
    }

    /// Load options; a missing file yields an empty map
    pub async fn load(&self) -> StrataResult<Options> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Options::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load options from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StrataResult<Options> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;

        Options::from_toml_str(&content).map_err(|e| StrataError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
