//! Configuration module for the cachewire server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default response fragment threshold in KiB.
pub const DEFAULT_FRAGMENT_SIZE_KB: usize = 80;

/// Command-line arguments for the cache server
#[derive(Parser, Debug, Default)]
#[command(name = "cachewire")]
#[command(author = "cachewire authors")]
#[command(version = "0.1.0")]
#[command(about = "Client connection and command-dispatch server for an in-memory cache", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9800)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrently connected clients
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Listen backlog (maximum pending connections)
    #[arg(long)]
    pub max_pending_connections: Option<u32>,

    /// Response fragment threshold in KiB
    #[arg(long)]
    pub fragment_size_kb: Option<usize>,

    /// Number of ordered command processors (0 = execute inline)
    #[arg(short = 'p', long)]
    pub command_processors: Option<usize>,

    /// Seconds a send or command may stay in progress before the client is dropped
    #[arg(long)]
    pub client_send_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub buffers: BuffersConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and protocol configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub max_connections: usize,
    pub max_pending_connections: u32,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub enable_acknowledgement: bool,
    pub enable_pipelining: bool,
    pub fragment_size_kb: usize,
    pub command_processors: usize,
    pub max_requests_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9800".to_string(),
            max_connections: 10_000,
            max_pending_connections: 300,
            send_buffer_size: 128 * 1024,
            receive_buffer_size: 128 * 1024,
            enable_acknowledgement: true,
            enable_pipelining: true,
            fragment_size_kb: DEFAULT_FRAGMENT_SIZE_KB,
            command_processors: 0,
            max_requests_per_second: 0,
        }
    }
}

/// Bad-client and idle monitor configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enable_bad_client_detection: bool,
    pub client_send_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub idle_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_bad_client_detection: false,
            client_send_timeout_secs: 90,
            poll_interval_ms: 5000,
            idle_timeout_secs: 0,
        }
    }
}

/// Event delivery configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub priority_ratio: usize,
    pub bulk_count: usize,
    pub bulk_interval_ms: u64,
    /// Per-connection backlog cap; the oldest events are dropped past it.
    pub max_queued: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            priority_ratio: 30,
            bulk_count: 50,
            bulk_interval_ms: 1000,
            max_queued: 10_000,
        }
    }
}

/// Receive buffer pool configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BuffersConfig {
    pub buffer_size: usize,
    pub pool_size: usize,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            pool_size: 1024,
        }
    }
}

/// Acknowledgment ledger configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub cleanup_interval_secs: u64,
    /// How long an abruptly disconnected client's entries survive.
    pub disconnected_retention_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 10,
            disconnected_retention_secs: 60,
        }
    }
}

/// Storage-related configuration for the bundled local engine
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Maximum memory usage in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
    /// Default TTL for items in seconds
    #[serde(default)]
    pub default_ttl: u64,
    /// Interval for running expiration cleanup in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
            default_ttl: 0,
            cleanup_interval: default_cleanup_interval(),
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

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_cleanup_interval() -> u64 {
    60 // 60 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub max_pending_connections: u32,
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub enable_acknowledgement: bool,
    pub enable_pipelining: bool,
    /// Response fragment threshold in bytes.
    pub fragment_size: usize,
    pub command_processors: usize,
    pub max_requests_per_second: u32,
    pub enable_bad_client_detection: bool,
    pub client_send_timeout: Duration,
    pub monitor_interval: Duration,
    /// `None` disables the idle monitor.
    pub idle_timeout: Option<Duration>,
    pub event_priority_ratio: usize,
    pub event_bulk_count: usize,
    pub event_bulk_interval: Duration,
    pub event_max_queued: usize,
    pub buffer_size: usize,
    pub buffer_pool_size: usize,
    pub ledger_cleanup_interval: Duration,
    pub ledger_retention: Duration,
    pub max_memory: usize,
    pub default_ttl: u64,
    pub cleanup_interval: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(CliArgs::default(), TomlConfig::default())
    }
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

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        if cli.max_connections.unwrap_or(file.server.max_connections) == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0"));
        }
        if file.buffers.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffers.buffer_size must be > 0"));
        }
        if file.events.bulk_count == 0 {
            return Err(ConfigError::Invalid("events.bulk_count must be > 0"));
        }
        Ok(Self::resolve(cli, file))
    }

    fn resolve(cli: CliArgs, file: TomlConfig) -> Self {
        let fragment_kb = cli
            .fragment_size_kb
            .unwrap_or(file.server.fragment_size_kb);
        // Values of one KiB or less fall back to the default threshold.
        let fragment_kb = if fragment_kb > 1 {
            fragment_kb
        } else {
            DEFAULT_FRAGMENT_SIZE_KB
        };

        let idle = file.monitor.idle_timeout_secs;

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(file.server.max_connections),
            max_pending_connections: cli
                .max_pending_connections
                .unwrap_or(file.server.max_pending_connections),
            send_buffer_size: file.server.send_buffer_size,
            receive_buffer_size: file.server.receive_buffer_size,
            enable_acknowledgement: file.server.enable_acknowledgement,
            enable_pipelining: file.server.enable_pipelining,
            fragment_size: fragment_kb * 1024,
            command_processors: cli
                .command_processors
                .unwrap_or(file.server.command_processors),
            max_requests_per_second: file.server.max_requests_per_second,
            // A timeout on the command line implies detection is wanted.
            enable_bad_client_detection: cli.client_send_timeout.is_some()
                || file.monitor.enable_bad_client_detection,
            client_send_timeout: Duration::from_secs(
                cli.client_send_timeout
                    .unwrap_or(file.monitor.client_send_timeout_secs),
            ),
            monitor_interval: Duration::from_millis(file.monitor.poll_interval_ms.max(1)),
            idle_timeout: (idle > 0).then(|| Duration::from_secs(idle)),
            event_priority_ratio: file.events.priority_ratio,
            event_bulk_count: file.events.bulk_count,
            event_bulk_interval: Duration::from_millis(file.events.bulk_interval_ms),
            event_max_queued: file.events.max_queued.max(file.events.bulk_count),
            buffer_size: file.buffers.buffer_size,
            buffer_pool_size: file.buffers.pool_size,
            ledger_cleanup_interval: Duration::from_secs(
                file.ledger.cleanup_interval_secs.max(1),
            ),
            ledger_retention: Duration::from_secs(file.ledger.disconnected_retention_secs),
            max_memory: file.storage.max_memory,
            default_ttl: file.storage.default_ttl,
            cleanup_interval: file.storage.cleanup_interval,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
