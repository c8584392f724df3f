//! Configuration module for echo-load.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::protocol::REQUEST_PAYLOAD;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the load client
#[derive(Parser, Debug, Default)]
#[command(name = "echo-load")]
#[command(author = "echo-load authors")]
#[command(version = "0.1.0")]
#[command(about = "Drives many concurrent connections against a TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host of the echo server
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port of the echo server
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of concurrent connections to open
    #[arg(short = 'C', long)]
    pub connections: Option<usize>,

    /// Request/response exchanges each connection performs before closing
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,

    /// Receive buffer size in bytes (must hold a full echo)
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Connect timeout in milliseconds (0 = operating system default)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Seconds between periodic stats lines (0 = disabled)
    #[arg(long)]
    pub report_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Echo server location
#[derive(Debug, Deserialize)]
pub struct TargetConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Shape of the generated load
#[derive(Debug, Deserialize)]
pub struct LoadConfig {
    /// Number of concurrent connections
    #[serde(default = "default_connections")]
    pub connections: usize,
    /// Exchanges per connection
    #[serde(default = "default_requests")]
    pub requests: u64,
    /// Receive buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Connect timeout in milliseconds
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            requests: default_requests(),
            buffer_size: default_buffer_size(),
            connect_timeout_ms: 0,
        }
    }
}

/// Periodic reporting configuration
#[derive(Debug, Deserialize, Default)]
pub struct ReportConfig {
    /// Seconds between stats lines
    #[serde(default)]
    pub interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7000
}

fn default_connections() -> usize {
    100
}

fn default_requests() -> u64 {
    10
}

fn default_buffer_size() -> usize {
    255
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub connections: usize,
    pub requests: u64,
    pub buffer_size: usize,
    pub connect_timeout: Option<Duration>,
    pub report_interval: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let connect_timeout_ms = cli
            .connect_timeout_ms
            .unwrap_or(toml_config.load.connect_timeout_ms);
        let report_interval = cli
            .report_interval
            .unwrap_or(toml_config.report.interval_secs);

        Config {
            host: cli.host.unwrap_or(toml_config.target.host),
            port: cli.port.unwrap_or(toml_config.target.port),
            connections: cli.connections.unwrap_or(toml_config.load.connections),
            requests: cli.requests.unwrap_or(toml_config.load.requests),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.load.buffer_size),
            connect_timeout: (connect_timeout_ms > 0)
                .then(|| Duration::from_millis(connect_timeout_ms)),
            report_interval: (report_interval > 0).then(|| Duration::from_secs(report_interval)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Reject settings the driver cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.connections == 0 {
            return Err(ConfigError::Invalid(
                "connections must be at least 1".to_string(),
            ));
        }
        if self.requests == 0 {
            return Err(ConfigError::Invalid("requests must be at least 1".to_string()));
        }
        if self.buffer_size < REQUEST_PAYLOAD.len() {
            return Err(ConfigError::Invalid(format!(
                "buffer size {} cannot hold a {}-byte echo",
                self.buffer_size,
                REQUEST_PAYLOAD.len()
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliArgs {
        CliArgs {
            log_level: "info".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(), TomlConfig::default());
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.connections, 100);
        assert_eq!(config.requests, 10);
        assert_eq!(config.buffer_size, 255);
        assert!(config.connect_timeout.is_none());
        assert!(config.report_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [target]
            host = "10.0.0.5"
            port = 9000

            [load]
            connections = 500
            requests = 3
            buffer_size = 7
            connect_timeout_ms = 250

            [report]
            interval_secs = 2

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(cli(), toml_config);
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 9000);
        assert_eq!(config.connections, 500);
        assert_eq!(config.requests, 3);
        assert_eq!(config.buffer_size, 7);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.report_interval, Some(Duration::from_secs(2)));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [target]
            port = 9000
            [load]
            connections = 500
        "#,
        )
        .unwrap();

        let args = CliArgs {
            port: Some(7001),
            connections: Some(5),
            log_level: "trace".to_string(),
            ..Default::default()
        };

        let config = Config::merge(args, toml_config);
        assert_eq!(config.port, 7001);
        assert_eq!(config.connections, 5);
        assert_eq!(config.log_level, "trace");
        // Untouched values fall through to defaults
        assert_eq!(config.requests, 10);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::merge(cli(), TomlConfig::default());

        config.buffer_size = REQUEST_PAYLOAD.len() - 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.buffer_size = REQUEST_PAYLOAD.len();
        assert!(config.validate().is_ok());

        config.requests = 0;
        assert!(config.validate().is_err());
        config.requests = 1;

        config.connections = 0;
        assert!(config.validate().is_err());
        config.connections = 1;

        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_parsing() {
        let args = CliArgs::try_parse_from([
            "echo-load", "-H", "localhost", "-p", "7005", "-C", "5", "-n", "3", "-b", "7",
        ])
        .unwrap();
        assert_eq!(args.host.as_deref(), Some("localhost"));
        assert_eq!(args.port, Some(7005));
        assert_eq!(args.connections, Some(5));
        assert_eq!(args.requests, Some(3));
        assert_eq!(args.buffer_size, Some(7));
    }

    #[test]
    fn test_cli_short_flags_are_distinct() {
        let args =
            CliArgs::try_parse_from(["echo-load", "-c", "load.toml", "-C", "12"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("load.toml")));
        assert_eq!(args.connections, Some(12));
    }
}
