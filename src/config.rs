//! Configuration module for the pagering server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Operating mode for the worker event loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Stream fixed payloads without pairing sends to receives.
    HalfDuplex,
    /// Serve the request/response page protocol.
    FullDuplex,
}

/// Command-line arguments for the page server
#[derive(Parser, Debug)]
#[command(name = "pagering")]
#[command(version = "0.1.0")]
#[command(about = "An io_uring page-serving engine", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7421)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connections assigned to each worker
    #[arg(short = 'n', long)]
    pub connections_per_worker: Option<usize>,

    /// Submission/completion queue depth per worker
    #[arg(short = 'q', long)]
    pub queue_depth: Option<u32>,

    /// Page size in bytes (also the payload buffer size class)
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Number of servable pages
    #[arg(long)]
    pub page_count: Option<usize>,

    /// In-flight operation budget per worker
    #[arg(long)]
    pub inflight: Option<usize>,

    /// Operating mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<Mode>,

    /// Run duration in seconds, measured from the first accepted connection
    #[arg(short = 'd', long)]
    pub duration: Option<u64>,

    /// Skip pinning buffers in physical memory
    #[arg(long)]
    pub no_pin: bool,

    /// Skip registering buffers with the kernel
    #[arg(long)]
    pub no_register: bool,

    /// Leave Nagle's algorithm enabled on accepted connections
    #[arg(long)]
    pub no_nodelay: bool,

    /// Metrics report output path ("-" for stdout)
    #[arg(short = 'o', long)]
    pub metrics_out: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Connections assigned to each worker
    #[serde(default = "default_connections_per_worker")]
    pub connections_per_worker: usize,
    /// Set TCP_NODELAY on accepted connections
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            connections_per_worker: default_connections_per_worker(),
            tcp_nodelay: true,
        }
    }
}

/// Event-loop and buffer-pool configuration
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Submission/completion queue depth per worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: u32,
    /// Page size in bytes
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Number of servable pages
    #[serde(default = "default_page_count")]
    pub page_count: usize,
    /// In-flight operation budget per worker
    #[serde(default = "default_inflight")]
    pub inflight_ops: usize,
    /// Operating mode
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Pin buffers in physical memory
    #[serde(default = "default_true")]
    pub pin_memory: bool,
    /// Register buffers with the kernel as one batch
    #[serde(default = "default_true")]
    pub register_buffers: bool,
    /// Run duration in seconds
    #[serde(default = "default_duration_secs")]
    pub run_duration_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            page_size: default_page_size(),
            page_count: default_page_count(),
            inflight_ops: default_inflight(),
            mode: default_mode(),
            pin_memory: true,
            register_buffers: true,
            run_duration_secs: default_duration_secs(),
        }
    }
}

/// Metrics output configuration
#[derive(Debug, Deserialize, Default)]
pub struct MetricsConfig {
    /// Report output path ("-" for stdout); defaults to a timestamped file
    pub output: Option<PathBuf>,
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

fn default_listen() -> String {
    "127.0.0.1:7421".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_connections_per_worker() -> usize {
    4
}

fn default_queue_depth() -> u32 {
    512
}

fn default_page_size() -> usize {
    4096
}

fn default_page_count() -> usize {
    1024
}

fn default_inflight() -> usize {
    256
}

fn default_mode() -> Mode {
    Mode::FullDuplex
}

fn default_duration_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub connections_per_worker: usize,
    pub queue_depth: u32,
    pub page_size: usize,
    pub page_count: usize,
    pub inflight_ops: usize,
    pub mode: Mode,
    pub pin_memory: bool,
    pub register_buffers: bool,
    pub run_duration: Duration,
    pub tcp_nodelay: bool,
    pub metrics_out: Option<PathBuf>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            connections_per_worker: cli
                .connections_per_worker
                .unwrap_or(toml_config.server.connections_per_worker),
            queue_depth: cli.queue_depth.unwrap_or(toml_config.engine.queue_depth),
            page_size: cli.page_size.unwrap_or(toml_config.engine.page_size),
            page_count: cli.page_count.unwrap_or(toml_config.engine.page_count),
            inflight_ops: cli.inflight.unwrap_or(toml_config.engine.inflight_ops),
            mode: cli.mode.unwrap_or(toml_config.engine.mode),
            pin_memory: !cli.no_pin && toml_config.engine.pin_memory,
            register_buffers: !cli.no_register && toml_config.engine.register_buffers,
            run_duration: Duration::from_secs(
                cli.duration.unwrap_or(toml_config.engine.run_duration_secs),
            ),
            tcp_nodelay: !cli.no_nodelay && toml_config.server.tcp_nodelay,
            metrics_out: cli.metrics_out.or(toml_config.metrics.output),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.connections_per_worker == 0 {
            return Err(ConfigError::Invalid(
                "connections_per_worker must be at least 1".into(),
            ));
        }
        if self.page_size == 0 || self.page_count == 0 {
            return Err(ConfigError::Invalid(
                "page_size and page_count must be non-zero".into(),
            ));
        }
        if self.inflight_ops == 0 {
            return Err(ConfigError::Invalid("inflight must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be non-zero".into()));
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
