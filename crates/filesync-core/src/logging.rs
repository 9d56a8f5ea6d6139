//! Category-gated logging.
//!
//! A `Logger` is a small `Copy` value built from an immutable `LogConfig` and
//! handed to each component when it is constructed. It decides whether a
//! message in a given category is shown; the actual output goes through
//! `tracing`, so the subscriber installed by the binary still controls
//! formatting and `RUST_LOG` filtering.

use serde::Deserialize;
use std::fmt::Display;
use tracing::{debug, error, info, warn};

/// Verbosity threshold, ordered from least to most verbose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Logging configuration, fixed for the lifetime of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Per-file sync chatter ("File synced: ...")
    pub show_sync: bool,
    /// Connect/disconnect/heartbeat events
    pub show_connection: bool,
    /// Protocol-level debug output
    pub show_debug: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_sync: true,
            show_connection: true,
            show_debug: false,
        }
    }
}

impl LogConfig {
    /// Warnings and connection events only.
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Warn,
            show_sync: false,
            show_connection: true,
            show_debug: false,
        }
    }

    /// Everything.
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            show_sync: true,
            show_connection: true,
            show_debug: true,
        }
    }

    /// Default `EnvFilter` directive for this config.
    pub fn filter_directive(&self) -> String {
        let level = self.level.as_directive();
        format!("{level},filesync_core={level},filesync_daemon={level},filesync={level}")
    }
}

/// Logging handle injected into components.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logger {
    config: LogConfig,
}

impl Logger {
    pub fn new(config: LogConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn error(&self, message: impl Display) {
        error!("{}", message);
    }

    pub fn warn(&self, message: impl Display) {
        if self.config.level >= LogLevel::Warn {
            warn!("{}", message);
        }
    }

    pub fn info(&self, message: impl Display) {
        if self.config.level >= LogLevel::Info {
            info!("{}", message);
        }
    }

    pub fn sync(&self, message: impl Display) {
        if self.sync_enabled() {
            info!(target: "filesync::sync", "{}", message);
        }
    }

    pub fn connection(&self, message: impl Display) {
        if self.connection_enabled() {
            info!(target: "filesync::connection", "{}", message);
        }
    }

    pub fn debug(&self, message: impl Display) {
        if self.debug_enabled() {
            debug!("{}", message);
        }
    }

    pub fn sync_enabled(&self) -> bool {
        self.config.show_sync && self.config.level >= LogLevel::Info
    }

    pub fn connection_enabled(&self) -> bool {
        self.config.show_connection && self.config.level >= LogLevel::Info
    }

    pub fn debug_enabled(&self) -> bool {
        self.config.show_debug && self.config.level >= LogLevel::Debug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Error);
    }

    #[test]
    fn test_default_config_gates() {
        let log = Logger::new(LogConfig::default());
        assert!(log.sync_enabled());
        assert!(log.connection_enabled());
        assert!(!log.debug_enabled());
    }

    #[test]
    fn test_quiet_hides_sync_but_not_connection_flag() {
        let log = Logger::new(LogConfig::quiet());
        assert!(!log.sync_enabled());
        // Connection output needs the info level even when the flag is on
        assert!(!log.connection_enabled());
        assert!(!log.debug_enabled());
    }

    #[test]
    fn test_verbose_enables_everything() {
        let log = Logger::new(LogConfig::verbose());
        assert!(log.sync_enabled());
        assert!(log.connection_enabled());
        assert!(log.debug_enabled());
    }

    #[test]
    fn test_debug_flag_needs_debug_level() {
        let log = Logger::new(LogConfig {
            show_debug: true,
            ..LogConfig::default()
        });
        assert!(!log.debug_enabled());
    }

    #[test]
    fn test_filter_directive() {
        let directive = LogConfig::quiet().filter_directive();
        assert!(directive.starts_with("warn,"));
        assert!(directive.contains("filesync_core=warn"));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: LogConfig = serde_json::from_str(r#"{"level":"debug"}"#).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.show_sync);
        assert!(!config.show_debug);
    }
}
