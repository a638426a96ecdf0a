//! Configuration module for the mcprobe client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::connection::Endpoint;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the probe client
#[derive(Parser, Debug)]
#[command(name = "mcprobe")]
#[command(author = "mcprobe authors")]
#[command(version = "0.1.0")]
#[command(about = "Send memcached text protocol requests and print the replies", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Server port (e.g., 11211)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connect timeout in milliseconds (defaults to the OS timeout)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Do not echo requests and replies as they are exchanged
    #[arg(short, long)]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Requests to send, one exchange each. Escapes such as \r\n, \0 and
    /// \xNN are decoded. Read from stdin when omitted.
    pub requests: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server endpoint configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to connect to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Client-side tuning
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    /// Size of a single socket read in bytes
    #[serde(default = "default_recv_chunk_size")]
    pub recv_chunk_size: usize,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            recv_chunk_size: default_recv_chunk_size(),
            connect_timeout_ms: None,
        }
    }
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
    11211
}

fn default_recv_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings a `MemcachedClient` is built from
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    pub recv_chunk_size: usize,
    pub connect_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host, port),
            recv_chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: None,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    pub quiet: bool,
    pub log_level: String,
    pub requests: Vec<String>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let connect_timeout = cli
            .connect_timeout_ms
            .or(toml_config.client.connect_timeout_ms)
            .map(Duration::from_millis);

        Config {
            client: ClientConfig {
                endpoint: Endpoint::new(
                    cli.host.unwrap_or(toml_config.server.host),
                    cli.port.unwrap_or(toml_config.server.port),
                ),
                recv_chunk_size: toml_config.client.recv_chunk_size,
                connect_timeout,
            },
            quiet: cli.quiet,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            requests: cli.requests,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
