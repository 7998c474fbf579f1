//! Logging setup
//!
//! The first boot in a process installs the global subscriber; later boots
//! (tests, embedders mounting several repositories) keep it.

use crate::config::{keys, ConfigSource};
use crate::error::{StrataError, StrataResult};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings derived from options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub directive: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl LogSettings {
    /// Read `log.level`, `log.format`, `log.file`; `fallback` is used when no
    /// level is configured
    pub fn from_options(options: &dyn ConfigSource, fallback: &str) -> StrataResult<Self> {
        let directive = options
            .value(keys::LOG_LEVEL)
            .unwrap_or_else(|| fallback.to_string());
        let format = match options.value(keys::LOG_FORMAT).as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(StrataError::invalid(format!(
                    "unknown log format '{}', expected text or json",
                    other
                )))
            }
        };
        Ok(Self {
            directive,
            format,
            file: options.value(keys::LOG_FILE),
        })
    }
}

/// Install the global subscriber if none is set yet
pub fn init(settings: &LogSettings) -> StrataResult<()> {
    let filter = EnvFilter::try_new(&settings.directive)
        .map_err(|e| StrataError::invalid(format!("log level '{}': {}", settings.directive, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match (&settings.file, settings.format) {
        (Some(path), format) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| StrataError::io(format!("opening log file {}", path), e))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            match format {
                LogFormat::Json => builder.json().try_init(),
                LogFormat::Text => builder.try_init(),
            }
        }
        (None, LogFormat::Json) => builder.json().with_writer(std::io::stderr).try_init(),
        (None, LogFormat::Text) => builder.without_time().with_writer(std::io::stderr).try_init(),
    };

    if let Err(e) = result {
        debug!("Keeping existing log subscriber: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;

    #[test]
    fn defaults_to_fallback_text() {
        let settings = LogSettings::from_options(&Options::new(), "strata=warn").unwrap();
        assert_eq!(settings.directive, "strata=warn");
        assert_eq!(settings.format, LogFormat::Text);
        assert!(settings.file.is_none());
    }

    #[test]
    fn reads_format_and_level() {
        let options = Options::new()
            .with("log.level", "strata=debug")
            .with("log.format", "json");
        let settings = LogSettings::from_options(&options, "strata=warn").unwrap();
        assert_eq!(settings.directive, "strata=debug");
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn rejects_unknown_format() {
        let options = Options::new().with("log.format", "xml");
        assert!(LogSettings::from_options(&options, "warn").is_err());
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = LogSettings::from_options(&Options::new(), "strata=warn").unwrap();
        init(&settings).unwrap();
        init(&settings).unwrap();
    }
}
