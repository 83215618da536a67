//! Configuration file model, precedence resolution and validation.
//!
//! A config file holds an `agent` and a `server` section. Values come from,
//! in order of precedence: command line or environment, the config file,
//! built-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::agent::AgentSettings;
use crate::codec;
use crate::retry::RetryPolicy;
use crate::server::ServerSettings;
use crate::storage::StorageSettings;

pub const DEFAULT_ADDRESS: &str = "localhost:8080";
pub const DEFAULT_POLL_INTERVAL: u64 = 2;
pub const DEFAULT_REPORT_INTERVAL: u64 = 10;
pub const DEFAULT_RATE_LIMIT: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 10;
pub const DEFAULT_STORE_INTERVAL: u64 = 300;
pub const DEFAULT_RESTORE: bool = true;
pub const DEFAULT_SHUTDOWN_GRACE: u64 = 10;
const DEFAULT_FILE_NAME: &str = "metrics-db.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
    #[error("loading key {path}: {source}")]
    Key {
        path: PathBuf,
        source: codec::CodecError,
    },
    #[error("rendering configuration: {0}")]
    Render(String),
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Agent section. Intervals and timeouts are whole seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub address: Option<String>,
    pub poll_interval: Option<u64>,
    pub report_interval: Option<u64>,
    pub rate_limit: Option<usize>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub request_timeout: Option<u64>,
}

/// Server section. The store interval is whole seconds; zero means every
/// write is persisted synchronously.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: Option<String>,
    pub store_interval: Option<u64>,
    pub file_storage_path: Option<PathBuf>,
    pub restore: Option<bool>,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<PathBuf>,
    pub trusted_subnet: Option<String>,
}

/// Whole config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds to wait for in-flight work after a shutdown signal.
    pub shutdown_grace: Option<u64>,
    pub agent: AgentConfig,
    pub server: ServerConfig,
}

/// Output formats for `--show-config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
    Toml,
}

/// Loads a config file, picking the parser by extension (YAML otherwise).
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let config = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
        _ => serde_yaml::from_str(&content).map_err(|e| parse_err(e.to_string()))?,
    };
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Renders a config in the requested format.
pub fn render<T: Serialize>(config: &T, format: Format) -> Result<String, ConfigError> {
    match format {
        Format::Json => {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Render(e.to_string()))
        }
        Format::Toml => {
            toml::to_string_pretty(config).map_err(|e| ConfigError::Render(e.to_string()))
        }
        Format::Yaml => serde_yaml::to_string(config).map_err(|e| ConfigError::Render(e.to_string())),
    }
}

fn default_file_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_FILE_NAME)
}

fn positive(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn non_empty_path(value: Option<PathBuf>) -> Option<PathBuf> {
    value.filter(|p| !p.as_os_str().is_empty())
}

impl AgentConfig {
    /// Fields set in `over` replace the ones in `self`.
    pub fn overlay(self, over: AgentConfig) -> Self {
        Self {
            address: over.address.or(self.address),
            poll_interval: over.poll_interval.or(self.poll_interval),
            report_interval: over.report_interval.or(self.report_interval),
            rate_limit: over.rate_limit.or(self.rate_limit),
            key: over.key.or(self.key),
            crypto_key: over.crypto_key.or(self.crypto_key),
            request_timeout: over.request_timeout.or(self.request_timeout),
        }
    }

    /// Every field filled, for display.
    pub fn with_defaults(self) -> Self {
        Self {
            address: self.address.or_else(|| Some(DEFAULT_ADDRESS.into())),
            poll_interval: self.poll_interval.or(Some(DEFAULT_POLL_INTERVAL)),
            report_interval: self.report_interval.or(Some(DEFAULT_REPORT_INTERVAL)),
            rate_limit: self.rate_limit.or(Some(DEFAULT_RATE_LIMIT)),
            request_timeout: self.request_timeout.or(Some(DEFAULT_REQUEST_TIMEOUT)),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("poll_interval", self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL))?;
        positive("report_interval", self.report_interval.unwrap_or(DEFAULT_REPORT_INTERVAL))?;
        positive("request_timeout", self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT))?;
        if self.rate_limit == Some(0) {
            return Err(invalid("rate_limit", "must be greater than zero"));
        }
        if self.address.as_deref() == Some("") {
            return Err(invalid("address", "must not be empty"));
        }
        Ok(())
    }

    /// Validates and resolves to runtime settings, loading the public key.
    pub fn resolve(self) -> Result<AgentSettings, ConfigError> {
        self.validate()?;
        let public_key = match non_empty_path(self.crypto_key) {
            Some(path) => Some(
                codec::load_public_key(&path).map_err(|source| ConfigError::Key { path, source })?,
            ),
            None => None,
        };
        Ok(AgentSettings {
            address: self.address.unwrap_or_else(|| DEFAULT_ADDRESS.into()),
            poll_interval: Duration::from_secs(self.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL)),
            report_interval: Duration::from_secs(
                self.report_interval.unwrap_or(DEFAULT_REPORT_INTERVAL),
            ),
            rate_limit: self.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
            hash_key: non_empty(self.key),
            public_key,
            request_timeout: Duration::from_secs(
                self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            ),
            retry: RetryPolicy::default(),
        })
    }
}

impl ServerConfig {
    /// Fields set in `over` replace the ones in `self`.
    pub fn overlay(self, over: ServerConfig) -> Self {
        Self {
            address: over.address.or(self.address),
            store_interval: over.store_interval.or(self.store_interval),
            file_storage_path: over.file_storage_path.or(self.file_storage_path),
            restore: over.restore.or(self.restore),
            database_dsn: over.database_dsn.or(self.database_dsn),
            key: over.key.or(self.key),
            crypto_key: over.crypto_key.or(self.crypto_key),
            trusted_subnet: over.trusted_subnet.or(self.trusted_subnet),
        }
    }

    /// Every field with a default filled, for display.
    pub fn with_defaults(self) -> Self {
        Self {
            address: self.address.or_else(|| Some(DEFAULT_ADDRESS.into())),
            store_interval: self.store_interval.or(Some(DEFAULT_STORE_INTERVAL)),
            file_storage_path: self.file_storage_path.or_else(|| Some(default_file_path())),
            restore: self.restore.or(Some(DEFAULT_RESTORE)),
            ..self
        }
    }

    fn subnet(&self) -> Result<Option<IpNet>, ConfigError> {
        match self.trusted_subnet.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(cidr) => cidr
                .parse::<IpNet>()
                .map(Some)
                .map_err(|e| invalid("trusted_subnet", format!("{cidr}: {e}"))),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.as_deref() == Some("") {
            return Err(invalid("address", "must not be empty"));
        }
        self.subnet()?;
        Ok(())
    }

    /// Validates and resolves to runtime settings. The private key path is
    /// checked here and loaded by the server.
    pub fn resolve(self) -> Result<ServerSettings, ConfigError> {
        self.validate()?;
        let trusted_subnet = self.subnet()?;
        let private_key = non_empty_path(self.crypto_key);
        if let Some(path) = &private_key {
            if !path.is_file() {
                return Err(invalid(
                    "crypto_key",
                    format!("{} is not a readable file", path.display()),
                ));
            }
        }

        Ok(ServerSettings {
            address: self.address.unwrap_or_else(|| DEFAULT_ADDRESS.into()),
            storage: StorageSettings {
                database_dsn: non_empty(self.database_dsn),
                // An explicitly empty path disables the snapshot file.
                file_path: Some(self.file_storage_path.unwrap_or_else(default_file_path)),
                store_interval: Duration::from_secs(
                    self.store_interval.unwrap_or(DEFAULT_STORE_INTERVAL),
                ),
            },
            restore: self.restore.unwrap_or(DEFAULT_RESTORE),
            hash_key: non_empty(self.key),
            private_key,
            trusted_subnet,
        })
    }
}

impl Config {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(ext: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{ext}"))
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_picks_parser_by_extension() {
        let yaml = write_config("yaml", "agent:\n  poll_interval: 5\nserver:\n  restore: false\n");
        let json = write_config("json", r#"{"agent":{"poll_interval":5},"server":{"restore":false}}"#);
        let toml = write_config("toml", "[agent]\npoll_interval = 5\n[server]\nrestore = false\n");

        for file in [&yaml, &json, &toml] {
            let config = load(file.path()).unwrap();
            assert_eq!(config.agent.poll_interval, Some(5));
            assert_eq!(config.server.restore, Some(false));
            assert_eq!(config.agent.address, None);
        }
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let file = write_config("json", "{not json");
        assert!(matches!(load(file.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            load(Path::new("/nonexistent/metric-collector.yaml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_overlay_prefers_command_line() {
        let file = AgentConfig {
            address: Some("collector:9000".into()),
            poll_interval: Some(5),
            ..Default::default()
        };
        let cli = AgentConfig {
            poll_interval: Some(1),
            ..Default::default()
        };
        let merged = file.overlay(cli);
        assert_eq!(merged.address.as_deref(), Some("collector:9000"));
        assert_eq!(merged.poll_interval, Some(1));
    }

    #[test]
    fn test_agent_defaults() {
        let settings = AgentConfig::default().resolve().unwrap();
        assert_eq!(settings.address, DEFAULT_ADDRESS);
        assert_eq!(settings.poll_interval, Duration::from_secs(2));
        assert_eq!(settings.report_interval, Duration::from_secs(10));
        assert_eq!(settings.rate_limit, 100);
        assert!(settings.hash_key.is_none());
        assert!(settings.public_key.is_none());
    }

    #[test]
    fn test_agent_validation() {
        let zero_poll = AgentConfig {
            poll_interval: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            zero_poll.validate(),
            Err(ConfigError::Invalid { field: "poll_interval", .. })
        ));

        let zero_rate = AgentConfig {
            rate_limit: Some(0),
            ..Default::default()
        };
        assert!(zero_rate.validate().is_err());

        let missing_key = AgentConfig {
            crypto_key: Some(PathBuf::from("/nonexistent/public.pem")),
            ..Default::default()
        };
        assert!(matches!(missing_key.resolve(), Err(ConfigError::Key { .. })));
    }

    #[test]
    fn test_server_defaults() {
        let settings = ServerConfig::default().resolve().unwrap();
        assert_eq!(settings.address, DEFAULT_ADDRESS);
        assert!(settings.restore);
        assert_eq!(settings.storage.store_interval, Duration::from_secs(300));
        assert_eq!(
            settings.storage.file_path,
            Some(std::env::temp_dir().join("metrics-db.json"))
        );
        assert!(settings.trusted_subnet.is_none());
    }

    #[test]
    fn test_server_subnet_and_empty_values() {
        let config = ServerConfig {
            trusted_subnet: Some("10.0.0.0/8".into()),
            key: Some(String::new()),
            database_dsn: Some(String::new()),
            ..Default::default()
        };
        let settings = config.resolve().unwrap();
        assert_eq!(settings.trusted_subnet, Some("10.0.0.0/8".parse().unwrap()));
        assert!(settings.hash_key.is_none());
        assert!(settings.storage.dsn().is_none());

        let bad = ServerConfig {
            trusted_subnet: Some("10.0.0.0/33".into()),
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(ConfigError::Invalid { field: "trusted_subnet", .. })
        ));
    }

    #[test]
    fn test_render_round_trips_through_yaml() {
        let config = Config {
            agent: AgentConfig::default().with_defaults(),
            server: ServerConfig::default().with_defaults(),
            shutdown_grace: Some(DEFAULT_SHUTDOWN_GRACE),
        };
        let yaml = render(&config, Format::Yaml).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
        assert!(render(&config, Format::Json).unwrap().contains("\"rate_limit\": 100"));
    }
}
