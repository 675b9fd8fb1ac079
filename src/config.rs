//! Configuration for the framed-echo binary.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;

use crate::client::ClientSettings;
use crate::protocol::{
    FrameSettings, UnterminatedPolicy, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_RECEIVE_BUFFER_SIZE,
};
use crate::runtime::PortConfig;
use crate::server::{AdmissionPolicy, ServerSettings, DEFAULT_BACKLOG, DEFAULT_EXCHANGE_TIMEOUT};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "framed-echo")]
#[command(version)]
#[command(about = "<EOF>-framed echo client and server on a completion port", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of continuation worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the echo server (default)
    Serve {
        /// Address to bind to (e.g., 127.0.0.1:11000)
        #[arg(short = 'l', long)]
        listen: Option<String>,

        /// Listen backlog
        #[arg(long)]
        backlog: Option<u32>,

        /// Finish each exchange before accepting the next connection
        #[arg(long)]
        sequential: bool,

        /// Maximum connections served at once
        #[arg(long)]
        max_connections: Option<usize>,

        /// Per-phase exchange timeout in milliseconds (0 = none)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send one message and print the reply
    Send {
        /// Server address (e.g., localhost:11000)
        #[arg(short = 's', long)]
        server: Option<String>,

        /// Per-phase timeout in milliseconds (0 = none)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Message to send
        message: Option<String>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    pub max_connections: Option<usize>,
    /// Per-phase exchange timeout (0 = none)
    #[serde(default = "default_exchange_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            admission: AdmissionPolicy::default(),
            max_connections: None,
            timeout_ms: default_exchange_timeout_ms(),
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub server: String,
    #[serde(default = "default_message")]
    pub message: String,
    /// Per-phase timeout (0 = none)
    #[serde(default = "default_client_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_listen(),
            message: default_message(),
            timeout_ms: default_client_timeout_ms(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub unterminated: UnterminatedPolicy,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: default_receive_buffer_size(),
            max_message_size: default_max_message_size(),
            unterminated: UnterminatedPolicy::default(),
        }
    }
}

/// Completion port configuration
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub workers: Option<usize>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: None,
            event_capacity: default_event_capacity(),
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
    "127.0.0.1:11000".to_string()
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_exchange_timeout_ms() -> u64 {
    DEFAULT_EXCHANGE_TIMEOUT.as_millis() as u64
}

fn default_message() -> String {
    "This is a test".to_string()
}

fn default_client_timeout_ms() -> u64 {
    30_000
}

fn default_receive_buffer_size() -> usize {
    DEFAULT_RECEIVE_BUFFER_SIZE
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Send,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub listen: String,
    pub backlog: u32,
    pub admission: AdmissionPolicy,
    pub max_connections: Option<usize>,
    pub exchange_timeout: Option<Duration>,
    pub server: String,
    pub message: String,
    pub client_timeout: Option<Duration>,
    pub receive_buffer_size: usize,
    pub max_message_size: usize,
    pub unterminated: UnterminatedPolicy,
    pub workers: usize,
    pub event_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::from_sources(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn from_sources(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            client,
            framing,
            runtime,
            logging,
        } = toml_config;

        let mut config = Config {
            mode: Mode::Serve,
            listen: server.listen,
            backlog: server.backlog,
            admission: server.admission,
            max_connections: server.max_connections,
            exchange_timeout: millis(server.timeout_ms),
            server: client.server,
            message: client.message,
            client_timeout: millis(client.timeout_ms),
            receive_buffer_size: framing.receive_buffer_size,
            max_message_size: framing.max_message_size,
            unterminated: framing.unterminated,
            workers: cli.workers.or(runtime.workers).unwrap_or(0),
            event_capacity: runtime.event_capacity,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };

        match cli.command {
            None => {}
            Some(Command::Serve {
                listen,
                backlog,
                sequential,
                max_connections,
                timeout_ms,
            }) => {
                config.mode = Mode::Serve;
                if let Some(listen) = listen {
                    config.listen = listen;
                }
                if let Some(backlog) = backlog {
                    config.backlog = backlog;
                }
                if sequential {
                    config.admission = AdmissionPolicy::Sequential;
                }
                config.max_connections = max_connections.or(config.max_connections);
                if let Some(timeout_ms) = timeout_ms {
                    config.exchange_timeout = millis(timeout_ms);
                }
            }
            Some(Command::Send {
                server,
                timeout_ms,
                message,
            }) => {
                config.mode = Mode::Send;
                if let Some(server) = server {
                    config.server = server;
                }
                if let Some(message) = message {
                    config.message = message;
                }
                if let Some(timeout_ms) = timeout_ms {
                    config.client_timeout = millis(timeout_ms);
                }
            }
        }

        config
    }

    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            receive_buffer_size: self.receive_buffer_size,
            max_message_size: self.max_message_size,
        }
    }

    pub fn port_config(&self) -> PortConfig {
        PortConfig {
            workers: self.workers,
            event_capacity: self.event_capacity,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            backlog: self.backlog,
            admission: self.admission,
            max_connections: self.max_connections,
            exchange_timeout: self.exchange_timeout,
            frame: self.frame_settings(),
            unterminated: self.unterminated,
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            frame: self.frame_settings(),
            timeout: self.client_timeout,
            unterminated: self.unterminated,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
