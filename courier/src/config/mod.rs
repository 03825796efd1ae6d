//! Configuration for the `Courier` client.
//!
//! [`CourierConfig`] holds the delivery tuning knobs used by the library.
//! [`ClientConfig`] wraps it for the `courier` binary and supports layered
//! loading with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::connection::ReconnectPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Library configuration
// ---------------------------------------------------------------------------

/// Delivery and connection tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourierConfig {
    /// Base delay of the reconnect backoff.
    pub reconnect_interval: Duration,
    /// Upper bound on a single reconnect delay.
    pub max_reconnect_interval: Duration,
    /// Reconnect attempts before the failure becomes fatal.
    pub max_reconnect_attempts: u32,
    /// Delay between heartbeat probes.
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the connection dead.
    pub heartbeat_timeout: Duration,
    /// Bound on a single open attempt.
    pub connection_timeout: Duration,
    /// Bound on a single frame write. A write that does not finish in time
    /// counts as a lost connection.
    pub write_timeout: Duration,
    /// How long to wait for an ack before retransmitting.
    pub message_ack_timeout: Duration,
    /// Retransmissions before a message fails.
    pub max_retries: u32,
    /// Messages buffered while not connected.
    pub offline_queue_capacity: usize,
    /// Capacity of the client task's command mailbox.
    pub command_buffer: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            ping_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            message_ack_timeout: Duration::from_millis(2000),
            max_retries: 3,
            offline_queue_capacity: 1000,
            command_buffer: 256,
        }
    }
}

impl CourierConfig {
    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero intervals or capacities, or
    /// a heartbeat timeout that is not shorter than the ping interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("reconnect_interval", self.reconnect_interval),
            ("max_reconnect_interval", self.max_reconnect_interval),
            ("ping_interval", self.ping_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("connection_timeout", self.connection_timeout),
            ("write_timeout", self.write_timeout),
            ("message_ack_timeout", self.message_ack_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.offline_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "offline_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(ConfigError::Invalid(
                "command_buffer must be greater than zero".into(),
            ));
        }
        if self.max_reconnect_interval < self.reconnect_interval {
            return Err(ConfigError::Invalid(
                "max_reconnect_interval must not be below reconnect_interval".into(),
            ));
        }
        if self.heartbeat_timeout >= self.ping_interval {
            return Err(ConfigError::Invalid(
                "heartbeat_timeout must be shorter than ping_interval".into(),
            ));
        }
        Ok(())
    }

    /// Backoff policy derived from the reconnect settings.
    #[must_use]
    pub const fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base: self.reconnect_interval,
            max: self.max_reconnect_interval,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    connection: ConnectionFileConfig,
    heartbeat: HeartbeatFileConfig,
    delivery: DeliveryFileConfig,
    queue: QueueFileConfig,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    url: Option<String>,
    reconnect_interval_ms: Option<u64>,
    max_reconnect_interval_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    connection_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

/// `[heartbeat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct HeartbeatFileConfig {
    ping_interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    message_ack_timeout_ms: Option<u64>,
    max_retries: Option<u32>,
}

/// `[queue]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct QueueFileConfig {
    offline_queue_capacity: Option<usize>,
    command_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved binary configuration
// ---------------------------------------------------------------------------

/// Default delivery backend URL.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:9000/ws";

/// Fully resolved configuration for the `courier` binary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the delivery backend.
    pub url: String,
    /// Library tuning.
    pub courier: CourierConfig,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Optional log file; logs go to stderr otherwise.
    pub log_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or if the merged values fail [`CourierConfig::validate`].
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.courier.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = CourierConfig::default();
        let ms = Duration::from_millis;

        let courier = CourierConfig {
            reconnect_interval: file
                .connection
                .reconnect_interval_ms
                .map_or(defaults.reconnect_interval, ms),
            max_reconnect_interval: file
                .connection
                .max_reconnect_interval_ms
                .map_or(defaults.max_reconnect_interval, ms),
            max_reconnect_attempts: cli
                .max_reconnect_attempts
                .or(file.connection.max_reconnect_attempts)
                .unwrap_or(defaults.max_reconnect_attempts),
            ping_interval: file
                .heartbeat
                .ping_interval_ms
                .map_or(defaults.ping_interval, ms),
            heartbeat_timeout: file
                .heartbeat
                .timeout_ms
                .map_or(defaults.heartbeat_timeout, ms),
            connection_timeout: file
                .connection
                .connection_timeout_ms
                .map_or(defaults.connection_timeout, ms),
            write_timeout: file
                .connection
                .write_timeout_ms
                .map_or(defaults.write_timeout, ms),
            message_ack_timeout: cli
                .ack_timeout_ms
                .or(file.delivery.message_ack_timeout_ms)
                .map_or(defaults.message_ack_timeout, ms),
            max_retries: cli
                .max_retries
                .or(file.delivery.max_retries)
                .unwrap_or(defaults.max_retries),
            offline_queue_capacity: file
                .queue
                .offline_queue_capacity
                .unwrap_or(defaults.offline_queue_capacity),
            command_buffer: file
                .queue
                .command_buffer
                .unwrap_or(defaults.command_buffer),
        };

        Self {
            url: cli
                .url
                .clone()
                .or_else(|| file.connection.url.clone())
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            courier,
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone(),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(
    version,
    about = "Send stdin lines as acknowledged messages and print what arrives"
)]
pub struct CliArgs {
    /// WebSocket URL of the delivery backend.
    #[arg(long, env = "COURIER_URL")]
    pub url: Option<String>,

    /// Path to config file (default: `~/.config/courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Acknowledgment timeout in milliseconds.
    #[arg(long)]
    pub ack_timeout_ms: Option<u64>,

    /// Retransmissions before a message is reported as failed.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Reconnect attempts before giving up.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("courier").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
