//! CLI arguments and subcommands for metric-collector.
//!
//! Every agent and server setting can also be given through the environment
//! variable named next to it.

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::{AgentConfig, Format, ServerConfig};

/// Log level options for CLI parsing
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

impl From<ConfigFormat> for Format {
    fn from(format: ConfigFormat) -> Self {
        match format {
            ConfigFormat::Yaml => Format::Yaml,
            ConfigFormat::Json => Format::Json,
            ConfigFormat::Toml => Format::Toml,
        }
    }
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "metric-collector",
    about = "Telemetry agent and collector for gauge and counter metrics",
    long_about = "Telemetry agent and collector for gauge and counter metrics.\n\n\
                  The agent polls process and host statistics and posts them to the \
                  collector, optionally compressed, signed with a shared key and encrypted \
                  with the collector's public key. The collector keeps the current value \
                  of every series in memory, a snapshot file or PostgreSQL.",
    version,
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long, global = true, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable config file loading
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Print the effective configuration and exit
    #[arg(long, global = true)]
    pub show_config: bool,

    /// Output format for --show-config
    #[arg(long, global = true, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate the configuration and exit (return code 1 on error)
    #[arg(long, global = true)]
    pub check_config: bool,

    /// Seconds to wait for in-flight work after a shutdown signal
    #[arg(long, global = true, env = "SHUTDOWN_GRACE")]
    pub shutdown_grace: Option<u64>,
}

/// Agent settings
#[derive(ClapArgs, Debug, Default)]
pub struct AgentArgs {
    /// Collector address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Seconds between polls
    #[arg(short = 'p', long, env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,

    /// Seconds between reports
    #[arg(short = 'r', long, env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,

    /// Shared HMAC-SHA256 key
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Maximum concurrent requests per report
    #[arg(short = 'l', long, env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,

    /// Collector public key (PEM)
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Seconds before a request times out
    #[arg(long, env = "REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,
}

/// Collector settings
#[derive(ClapArgs, Debug, Default)]
pub struct ServerArgs {
    /// Listen address (host:port)
    #[arg(short = 'a', long, env = "ADDRESS")]
    pub address: Option<String>,

    /// Seconds between snapshot dumps (0 = write through)
    #[arg(short = 'i', long, env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,

    /// Snapshot file path (empty = no snapshot)
    #[arg(short = 'f', long, env = "FILE_STORAGE_PATH")]
    pub file_storage_path: Option<PathBuf>,

    /// Load the snapshot file at startup
    #[arg(short = 'r', long, env = "RESTORE")]
    pub restore: Option<bool>,

    /// PostgreSQL DSN; selects the database backend
    #[arg(short = 'd', long, env = "DATABASE_DSN", hide_env_values = true)]
    pub database_dsn: Option<String>,

    /// Shared HMAC-SHA256 key
    #[arg(short = 'k', long, env = "KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Collector private key (PEM)
    #[arg(long, env = "CRYPTO_KEY")]
    pub crypto_key: Option<PathBuf>,

    /// Accept requests only from this CIDR (X-Real-IP)
    #[arg(short = 't', long, env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<String>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll local statistics and report them to a collector
    Agent(AgentArgs),

    /// Receive and store metrics
    Server(ServerArgs),

    /// Generate an RSA key pair for body encryption
    Keygen {
        /// Output directory
        #[arg(long, default_value = ".")]
        dir: PathBuf,

        /// Modulus size in bits
        #[arg(long, default_value_t = 4096)]
        bits: usize,
    },
}

impl From<&AgentArgs> for AgentConfig {
    fn from(args: &AgentArgs) -> Self {
        Self {
            address: args.address.clone(),
            poll_interval: args.poll_interval,
            report_interval: args.report_interval,
            rate_limit: args.rate_limit,
            key: args.key.clone(),
            crypto_key: args.crypto_key.clone(),
            request_timeout: args.request_timeout,
        }
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            address: args.address.clone(),
            store_interval: args.store_interval,
            file_storage_path: args.file_storage_path.clone(),
            restore: args.restore,
            database_dsn: args.database_dsn.clone(),
            key: args.key.clone(),
            crypto_key: args.crypto_key.clone(),
            trusted_subnet: args.trusted_subnet.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_agent_flags() {
        let args = Args::try_parse_from([
            "metric-collector",
            "agent",
            "-a",
            "collector:8080",
            "-p",
            "1",
            "-l",
            "4",
        ])
        .unwrap();
        let Commands::Agent(agent) = args.command else {
            panic!("expected agent subcommand");
        };
        let config = AgentConfig::from(&agent);
        assert_eq!(config.address.as_deref(), Some("collector:8080"));
        assert_eq!(config.poll_interval, Some(1));
        assert_eq!(config.rate_limit, Some(4));
        assert_eq!(config.report_interval, None);
    }

    #[test]
    fn test_server_flags_and_global_options() {
        let args = Args::try_parse_from([
            "metric-collector",
            "server",
            "-i",
            "0",
            "-r",
            "false",
            "-t",
            "192.168.1.0/24",
            "--show-config",
            "--config-format",
            "json",
        ])
        .unwrap();
        assert!(args.show_config);
        assert!(matches!(args.config_format, ConfigFormat::Json));
        let Commands::Server(server) = args.command else {
            panic!("expected server subcommand");
        };
        let config = ServerConfig::from(&server);
        assert_eq!(config.store_interval, Some(0));
        assert_eq!(config.restore, Some(false));
        assert_eq!(config.trusted_subnet.as_deref(), Some("192.168.1.0/24"));
    }
}
