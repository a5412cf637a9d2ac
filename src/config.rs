//! Process-level configuration for the `framed-tcp-server` binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, the same
//! two-layer merge the teacher crate uses for its own `config.rs`.
//!
//! This is ambient entrypoint scaffolding, not a library concern — the
//! library's own `framed_tcp_server::ServerConfig` is the plain struct
//! `Server::new` actually takes.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the framing server binary.
#[derive(Parser, Debug)]
#[command(name = "framed-tcp-server")]
#[command(author = "framed-tcp-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A length-prefixed TCP framing server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to bind to
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Maximum accepted frame body length in bytes
    #[arg(long)]
    pub max_body_len: Option<u32>,

    /// Maximum number of simultaneously accepted connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of reactor worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerTomlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerTomlConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_body_len")]
    pub max_body_len: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub workers: Option<usize>,
}

impl Default for ServerTomlConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_body_len: default_max_body_len(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_max_body_len() -> u32 {
    framed_tcp_server::DEFAULT_MAX_BODY_LEN
}

fn default_max_connections() -> usize {
    65536
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration the binary uses to build a `Server`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub port: u16,
    pub max_body_len: u32,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and an optional TOML file. CLI
    /// arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_body_len: cli.max_body_len.unwrap_or(toml_config.server.max_body_len),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Build the library-level config this binary will hand to `Server::new`.
    pub fn to_server_config(&self) -> framed_tcp_server::ServerConfig {
        framed_tcp_server::ServerConfig {
            host: self.listen.clone(),
            max_body_len: self.max_body_len,
            max_connections: self.max_connections,
            workers: self
                .workers
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
            reaper: framed_tcp_server::runtime::reaper::ReaperConfig::default(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
