//! Configuration for the demo binaries.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::net::socket::SOCKET_BUFFER_SIZE;
use crate::rpc::wire::DEFAULT_MAX_PAYLOAD_LEN;

/// Which reactor backend drives the sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Readiness-based (mio: epoll/kqueue).
    Poll,
    /// Completion-based (io_uring, Linux only).
    Uring,
}

/// Command-line arguments for the echo server.
#[derive(Parser, Debug)]
#[command(name = "wirecall")]
#[command(version = "0.1.0")]
#[command(about = "Asynchronous RPC transport demo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8890)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Reactor backend
    #[arg(short = 'b', long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Number of reactor threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub backend: Option<BackendKind>,
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: None,
            workers: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TransportSection {
    /// Kernel send/receive buffer size per connection, in bytes.
    #[serde(default = "default_socket_buffer_size")]
    pub socket_buffer_size: usize,
    /// Reactor task queue capacity.
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    /// Largest accepted payload body, in bytes.
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: u32,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            socket_buffer_size: default_socket_buffer_size(),
            task_queue_capacity: default_task_queue_capacity(),
            max_payload_len: default_max_payload_len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8890".to_string()
}

fn default_socket_buffer_size() -> usize {
    SOCKET_BUFFER_SIZE
}

fn default_task_queue_capacity() -> usize {
    1024
}

fn default_max_payload_len() -> u32 {
    DEFAULT_MAX_PAYLOAD_LEN
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backend: BackendKind,
    pub workers: usize,
    pub socket_buffer_size: usize,
    pub task_queue_capacity: usize,
    pub max_payload_len: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backend: cli
                .backend
                .or(toml_config.server.backend)
                .unwrap_or(BackendKind::Poll),
            workers: cli.workers.or(toml_config.server.workers).unwrap_or(0),
            socket_buffer_size: toml_config.transport.socket_buffer_size,
            task_queue_capacity: toml_config.transport.task_queue_capacity,
            max_payload_len: toml_config.transport.max_payload_len,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8890");
        assert_eq!(config.transport.socket_buffer_size, 512 * 1024);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            backend = "uring"
            workers = 4

            [transport]
            socket_buffer_size = 65536
            max_payload_len = 1048576

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.backend, Some(BackendKind::Uring));
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.transport.socket_buffer_size, 65536);
        assert_eq!(config.transport.max_payload_len, 1048576);
        assert_eq!(config.logging.level, "debug");
    }
}
