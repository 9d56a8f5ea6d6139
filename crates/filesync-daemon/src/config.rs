//! Layered configuration: TOML file, then environment, then CLI flags.

use crate::client::ReconnectConfig;
use crate::relay::RelayOptions;
use crate::session::SessionOptions;
use filesync_core::{Limits, LogConfig, ReplicaConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidEnv {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid setting {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    /// Socket address to accept clients on
    pub listen: String,
    pub heartbeat_interval_ms: u64,
    /// Watch the mirror root and broadcast local edits
    pub watch: bool,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1420".into(),
            heartbeat_interval_ms: 30_000,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub relay_url: String,
    /// Fixed origin id; a fresh uuid is used when unset
    pub client_id: Option<String>,
    /// Ask the relay to clear its folder when sync stops
    pub clear_on_stop: bool,
    pub clear_timeout_ms: u64,
    /// Reconnect with backoff after the relay connection drops (opt-in)
    pub reconnect: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:1420".into(),
            client_id: None,
            clear_on_stop: true,
            clear_timeout_ms: 2000,
            reconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The mirrored folder
    pub root: PathBuf,
    pub relay: RelaySection,
    pub client: ClientSection,
    pub reconnect: ReconnectConfig,
    pub limits: Limits,
    /// Sync `.git` contents instead of always ignoring them
    pub sync_git_folder: bool,
    pub suppress_ttl_ms: u64,
    pub ignore_cache_ttl_ms: u64,
    pub logging: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./synced-files"),
            relay: RelaySection::default(),
            client: ClientSection::default(),
            reconnect: ReconnectConfig::default(),
            limits: Limits::default(),
            sync_git_folder: false,
            suppress_ttl_ms: 2000,
            ignore_cache_ttl_ms: 5000,
            logging: LogConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, overlaid with the TOML file at `path` if one is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_env_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("BASE_DIR") {
            self.root = PathBuf::from(dir);
        }
        if let Some(value) = lookup("PORT") {
            let port: u16 = parse_env("PORT", &value)?;
            self.relay.listen = with_port(&self.relay.listen, port);
        }
        if let Some(value) = lookup("PING_INTERVAL") {
            self.relay.heartbeat_interval_ms = parse_env("PING_INTERVAL", &value)?;
        }
        if let Some(url) = lookup("RELAY_URL") {
            self.client.relay_url = url;
        }
        if let Some(value) = lookup("MAX_FILE_SIZE") {
            self.limits.max_file_size = parse_env("MAX_FILE_SIZE", &value)?;
        }
        if let Some(value) = lookup("MAX_PAYLOAD_SIZE") {
            self.limits.max_payload_size = parse_env("MAX_PAYLOAD_SIZE", &value)?;
        }
        Ok(())
    }

    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.heartbeat_interval_ms must be positive".into(),
            ));
        }
        if u128::from(self.limits.max_file_size) > self.limits.max_payload_size as u128 {
            return Err(ConfigError::Invalid(format!(
                "limits.max_file_size ({}) exceeds limits.max_payload_size ({})",
                self.limits.max_file_size, self.limits.max_payload_size
            )));
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnect.backoff_factor must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn replica_config(&self, origin_id: &str) -> ReplicaConfig {
        ReplicaConfig {
            origin_id: origin_id.to_string(),
            limits: self.limits,
            suppress_ttl: Duration::from_millis(self.suppress_ttl_ms),
            ignore_cache_ttl: Duration::from_millis(self.ignore_cache_ttl_ms),
            sync_git_folder: self.sync_git_folder,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            root: self.root.clone(),
            heartbeat_interval: Duration::from_millis(self.relay.heartbeat_interval_ms),
            replica: self.replica_config(filesync_core::protocol::RELAY_ORIGIN),
            watch: self.relay.watch,
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            relay_url: self.client.relay_url.clone(),
            clear_on_stop: self.client.clear_on_stop,
            clear_timeout: Duration::from_millis(self.client.clear_timeout_ms),
            auto_reconnect: self.client.reconnect,
            reconnect: self.reconnect.clone(),
        }
    }
}

fn parse_env<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Replace the port of a `host:port` listen address.
fn with_port(listen: &str, port: u16) -> String {
    let host = listen
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(listen);
    format!("{}:{}", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filesync_core::LogLevel;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.root, PathBuf::from("./synced-files"));
        assert_eq!(config.relay.listen, "0.0.0.0:1420");
        assert_eq!(config.relay.heartbeat_interval_ms, 30_000);
        assert_eq!(config.client.relay_url, "ws://127.0.0.1:1420");
        assert!(config.client.clear_on_stop);
        assert!(!config.client.reconnect);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.limits.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.limits.max_payload_size, 100 * 1024 * 1024);
        assert!(!config.sync_git_folder);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::parse(
            r#"
root = "/srv/mirror"
sync_git_folder = true

[relay]
heartbeat_interval_ms = 5000

[client]
clear_on_stop = false
reconnect = true

[reconnect]
initial_delay_ms = 500
max_attempts = 0

[limits]
max_file_size = 1024

[logging]
level = "debug"
show_sync = false
"#,
            Path::new("test.toml"),
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/srv/mirror"));
        assert!(config.sync_git_folder);
        assert_eq!(config.relay.heartbeat_interval_ms, 5000);
        assert_eq!(config.relay.listen, "0.0.0.0:1420");
        assert!(!config.client.clear_on_stop);
        assert!(config.client.reconnect);
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.limits.max_file_size, 1024);
        assert_eq!(config.limits.max_payload_size, 100 * 1024 * 1024);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert!(!config.logging.show_sync);
        assert!(config.logging.show_connection);
    }

    #[test]
    fn test_mistyped_toml_is_parse_error() {
        let err = Config::parse("root = 12", Path::new("bad.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_with(env(&[
                ("BASE_DIR", "/data"),
                ("PORT", "9000"),
                ("PING_INTERVAL", "1000"),
                ("RELAY_URL", "ws://relay:9000"),
                ("MAX_FILE_SIZE", "2048"),
            ]))
            .unwrap();

        assert_eq!(config.root, PathBuf::from("/data"));
        assert_eq!(config.relay.listen, "0.0.0.0:9000");
        assert_eq!(config.relay.heartbeat_interval_ms, 1000);
        assert_eq!(config.client.relay_url, "ws://relay:9000");
        assert_eq!(config.limits.max_file_size, 2048);
    }

    #[test]
    fn test_malformed_env_is_error() {
        let mut config = Config::default();
        let err = config
            .apply_env_with(env(&[("PORT", "eighty")]))
            .unwrap_err();

        match err {
            ConfigError::InvalidEnv { name, value, .. } => {
                assert_eq!(name, "PORT");
                assert_eq!(value, "eighty");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_validate_rejects_file_larger_than_payload() {
        let mut config = Config::default();
        config.limits.max_payload_size = 10;
        config.limits.max_file_size = 11;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("0.0.0.0:1420", 80), "0.0.0.0:80");
        assert_eq!(with_port("[::1]:1420", 80), "[::1]:80");
        assert_eq!(with_port("localhost", 80), "localhost:80");
    }

    #[test]
    fn test_derived_options() {
        let config = Config::default();

        let relay = config.relay_options();
        assert_eq!(relay.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(relay.replica.origin_id, "relay");

        let session = config.session_options();
        assert_eq!(session.clear_timeout, Duration::from_secs(2));
        assert!(!session.auto_reconnect);

        let replica = config.replica_config("peer-1");
        assert_eq!(replica.suppress_ttl, Duration::from_secs(2));
        assert_eq!(replica.ignore_cache_ttl, Duration::from_secs(5));
    }
}
