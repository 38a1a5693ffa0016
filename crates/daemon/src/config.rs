//! Configuration management for the termgate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termgate/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::WindowSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::terminal::{BridgeConfig, ShellCommand, WRITE_DEADLINE};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("terminal dimensions must be greater than 0, got {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },

    #[error("bind_address is not a valid socket address: {0}")]
    InvalidBindAddress(String),

    #[error("rotation must be one of: minutely, hourly, daily, never; got {0}")]
    InvalidRotation(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid log file rotation periods.
const VALID_ROTATIONS: &[&str] = &["minutely", "hourly", "daily", "never"];

/// Main configuration structure for the termgate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Shell and pty settings.
    pub terminal: TerminalConfig,

    /// Log file output.
    pub log: LogConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (PID file, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Budget for stopping every service on shutdown.
    pub shutdown_timeout_secs: u64,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether the terminal server runs at all.
    pub enabled: bool,

    /// Address to listen on.
    pub bind_address: String,

    /// How long open sessions get to finish once the server stops.
    pub shutdown_grace_secs: u64,
}

/// Shell and pty settings for new sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell to start.
    pub shell: String,

    /// Working directory for the shell. Unset inherits the daemon's.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Value of `TERM` in the shell environment.
    pub term: String,

    /// Initial width in columns.
    pub cols: u16,

    /// Initial height in rows.
    pub rows: u16,
}

/// Log file output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for log files. Unset means `<data_dir>/logs`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Rotation period (minutely, hourly, daily, never).
    pub rotation: String,

    /// Number of rotated files to keep.
    pub max_files: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            working_dir: None,
            term: "xterm-256color".to_string(),
            cols: 120,
            rows: 30,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: None,
            rotation: "daily".to_string(),
            max_files: 7,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
}

fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl DaemonConfig {
    /// Shutdown budget as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Location of the PID file.
    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join("termgate.pid")
    }
}

impl ServerConfig {
    /// Parsed listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidBindAddress`] if the address does not parse.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.bind_address.clone()))
    }

    /// Grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl TerminalConfig {
    /// Builds the session settings used by the terminal bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        let mut command = ShellCommand::new(&self.shell).env("TERM", &self.term);
        if let Some(ref dir) = self.working_dir {
            command = command.cwd(dir);
        }
        BridgeConfig {
            command,
            initial_size: WindowSize::new(self.cols, self.rows),
            write_deadline: WRITE_DEADLINE,
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMGATE_BIND_ADDRESS: Override the listen address
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("TERMGATE_BIND_ADDRESS") {
            if !addr.is_empty() {
                tracing::info!("Overriding bind_address from environment: {}", addr);
                self.server.bind_address = addr;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error for the first invalid value found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        let shell_path = Path::new(&self.terminal.shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.terminal.shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(self.terminal.shell.clone()));
        }

        if self.terminal.cols == 0 || self.terminal.rows == 0 {
            return Err(ConfigError::InvalidDimensions {
                cols: self.terminal.cols,
                rows: self.terminal.rows,
            });
        }

        self.server.socket_addr()?;

        let rotation = self.log.rotation.to_lowercase();
        if !VALID_ROTATIONS.contains(&rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(self.log.rotation.clone()));
        }

        Ok(())
    }

    /// Directory log files are written to.
    pub fn log_dir(&self) -> PathBuf {
        self.log
            .dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("logs"))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
