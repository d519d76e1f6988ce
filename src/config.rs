//! Configuration module for the muxbench server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Command-line arguments for the benchmark server
#[derive(Parser, Debug)]
#[command(name = "muxbench")]
#[command(author = "muxbench authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP server comparing poll, level-triggered and edge-triggered dispatch", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (default 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<IpAddr>,

    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u32>,

    /// Readiness strategy
    #[arg(short = 't', long, value_enum)]
    pub strategy: Option<StrategyType>,

    /// Number of worker processes (edge strategy only)
    #[arg(short = 'P', long)]
    pub workers: Option<usize>,

    /// Per-connection protocol
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Maximum open connections per dispatcher
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Readiness strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StrategyType {
    /// poll(2) over a rebuilt interest list
    #[default]
    Poll,
    /// Level-triggered epoll (Linux only)
    Level,
    /// Edge-triggered readiness across forked workers
    Edge,
}

/// Protocol selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    #[default]
    Echo,
    Discard,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub strategy: StrategyType,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            strategy: StrategyType::default(),
            workers: default_workers(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
        }
    }
}

/// Dispatch loop tuning
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Events returned by one wait
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Size of a single read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Bytes read per connection per turn (poll and level)
    #[serde(default = "default_read_quota")]
    pub read_quota: usize,
    /// Pending output above which a connection is dropped
    #[serde(default = "default_max_outbound")]
    pub max_outbound: usize,
    /// Wait timeout in milliseconds; unset blocks until activity
    pub wait_timeout_ms: Option<u64>,
    /// Close connections idle this long; unset disables the sweep
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            read_chunk: default_read_chunk(),
            read_quota: default_read_quota(),
            max_outbound: default_max_outbound(),
            wait_timeout_ms: None,
            idle_timeout_secs: None,
        }
    }
}

/// Protocol configuration
#[derive(Debug, Deserialize, Default)]
pub struct ProtocolConfig {
    #[serde(default)]
    pub kind: ProtocolType,
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u32 {
    7000
}

fn default_workers() -> usize {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_events() -> usize {
    1024
}

fn default_read_chunk() -> usize {
    16 * 1024
}

fn default_read_quota() -> usize {
    64 * 1024
}

fn default_max_outbound() -> usize {
    4 * 1024 * 1024 // 4 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u32,
    pub strategy: StrategyType,
    pub workers: usize,
    pub backlog: i32,
    pub max_connections: usize,
    pub protocol: ProtocolType,
    pub max_events: usize,
    pub read_chunk: usize,
    pub read_quota: usize,
    pub max_outbound: usize,
    pub wait_timeout_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI args against the file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            dispatch,
            protocol,
            logging,
        } = toml_config;

        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            strategy: cli.strategy.unwrap_or(server.strategy),
            workers: cli.workers.unwrap_or(server.workers),
            backlog: server.backlog,
            max_connections: cli.max_connections.unwrap_or(server.max_connections),
            protocol: cli.protocol.unwrap_or(protocol.kind),
            max_events: dispatch.max_events,
            read_chunk: dispatch.read_chunk,
            read_quota: dispatch.read_quota,
            max_outbound: dispatch.max_outbound,
            wait_timeout_ms: dispatch.wait_timeout_ms,
            idle_timeout_secs: dispatch.idle_timeout_secs,
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("workers", self.workers),
            ("max_events", self.max_events),
            ("read_chunk", self.read_chunk),
            ("read_quota", self.read_quota),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["muxbench"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::from_args(cli(&[])).unwrap();
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.port, 7000);
        assert_eq!(config.strategy, StrategyType::Poll);
        assert_eq!(config.workers, 1);
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.protocol, ProtocolType::Echo);
        assert_eq!(config.read_quota, 64 * 1024);
        assert_eq!(config.wait_timeout_ms, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9000
            strategy = "edge"
            workers = 4
            backlog = 128

            [dispatch]
            read_quota = 8192
            idle_timeout_secs = 30

            [protocol]
            kind = "discard"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.strategy, StrategyType::Edge);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.dispatch.read_quota, 8192);
        assert_eq!(config.dispatch.read_chunk, 16 * 1024);
        assert_eq!(config.dispatch.idle_timeout_secs, Some(30));
        assert_eq!(config.protocol.kind, ProtocolType::Discard);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let toml_str = r#"
            [server]
            strategy = "kqueue"
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
        assert!(CliArgs::try_parse_from(["muxbench", "-t", "kqueue"]).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            strategy = "level"
            workers = 2

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let args = cli(&["-p", "7100", "-t", "edge", "-P", "8", "--protocol", "discard"]);
        let config = Config::merge(args, file).unwrap();
        assert_eq!(config.port, 7100);
        assert_eq!(config.strategy, StrategyType::Edge);
        assert_eq!(config.workers, 8);
        assert_eq!(config.protocol, ProtocolType::Discard);
        // Not given on the command line, so the file wins.
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validation() {
        let err = Config::from_args(cli(&["-P", "0"])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("workers"));

        // Range is checked at bind time.
        assert_eq!(Config::from_args(cli(&["-p", "70000"])).unwrap().port, 70000);

        let file: TomlConfig = toml::from_str("[dispatch]\nread_quota = 0\n").unwrap();
        assert!(Config::merge(cli(&[]), file).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::from_args(cli(&["--config", "/nonexistent/muxbench.toml"])).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
    }
}
