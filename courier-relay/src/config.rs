//! Relay settings.
//!
//! A value given on the command line (or through its environment variable)
//! wins over `~/.config/courier-relay/config.toml`, which wins over the
//! built-in values.

use std::path::{Path, PathBuf};

/// Why the relay settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this relay.
    #[error("malformed relay settings: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A merged value cannot be used.
    #[error("invalid relay setting: {0}")]
    Invalid(String),
}

/// On-disk layout. Every key is optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SettingsFile {
    server: ServerSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerSection {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
}

/// Command line of the `courier-relay` binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Courier reference relay")]
pub struct RelayCliArgs {
    /// Listen address, for example `127.0.0.1:9000`.
    #[arg(short, long, env = "COURIER_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Settings file to use instead of the per-user one.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest frame, in bytes, the relay will read from a client.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Tracing filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "COURIER_RELAY_LOG")]
    pub log_level: String,
}

/// Settings the relay runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: String,
    /// Frames above this size are dropped unread.
    pub max_payload_size: usize,
    /// Tracing filter.
    pub log_level: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_owned(),
            max_payload_size: courier_proto::codec::MAX_FRAME_SIZE,
            log_level: "info".to_owned(),
        }
    }
}

impl RelayConfig {
    /// Read the settings file, merge it with `cli`, and check the result.
    ///
    /// An explicit `--config` path must exist. The per-user file is optional.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if a
    /// merged value is unusable.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = read_settings(cli.config.as_deref())?;
        let config = Self::merge(cli, file);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot start with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("bind_addr is empty".to_owned()));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::Invalid(
                "max_payload_size must be at least one byte".to_owned(),
            ));
        }
        Ok(())
    }

    fn merge(cli: &RelayCliArgs, file: SettingsFile) -> Self {
        let builtin = Self::default();
        let server = file.server;
        Self {
            bind_addr: cli
                .bind
                .clone()
                .or(server.bind_addr)
                .unwrap_or(builtin.bind_addr),
            max_payload_size: cli
                .max_payload_size
                .or(server.max_payload_size)
                .unwrap_or(builtin.max_payload_size),
            log_level: cli.log_level.clone(),
        }
    }
}

/// Per-user settings file location, if the platform has a config directory.
fn user_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("courier-relay").join("config.toml"))
}

fn read_settings(explicit: Option<&Path>) -> Result<SettingsFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match user_settings_path() {
            Some(path) => (path, false),
            None => return Ok(SettingsFile::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            Ok(SettingsFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
