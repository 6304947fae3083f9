//! Configuration types for portwarden
//!
//! This module defines the process settings used by the daemon, the
//! interactive instance and the CLI. Settings are loaded from JSON files and
//! validated at startup. User-facing preferences that travel with the rule
//! set live in [`crate::model::AppConfig`] instead.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application name used for default paths
pub const APP_NAME: &str = "portwarden";

/// Candidate loopback ports for the TCP RPC transport, tried in order
pub const DEFAULT_IPC_PORTS: [u16; 5] = [19846, 19856, 19866, 19876, 19886];

/// Candidate loopback ports for the TCP wake-up channel, tried in order
pub const DEFAULT_WAKEUP_PORTS: [u16; 5] = [19847, 19857, 19867, 19877, 19887];

/// Root settings structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the persisted rule set
    pub data_dir: Option<PathBuf>,

    /// Logging configuration
    pub log: LogConfig,

    /// Engine tuning
    pub engine: EngineConfig,

    /// RPC transport configuration
    pub ipc: IpcConfig,

    /// Single-instance coordination
    pub instance: InstanceConfig,
}

impl Settings {
    /// Validate the settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.ipc.validate()?;
        self.instance.validate()?;
        Ok(())
    }

    /// Create the default settings
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Resolve the persistence directory
    ///
    /// Explicit setting first, then `PORTWARDEN_DATA_DIR`, then the
    /// platform default.
    #[must_use]
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("PORTWARDEN_DATA_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        default_data_dir()
    }
}

/// Platform default persistence directory
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let base = std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".into());
        PathBuf::from(base).join(APP_NAME)
    }

    #[cfg(unix)]
    {
        if nix::unistd::Uid::effective().is_root() {
            return PathBuf::from("/var/lib").join(APP_NAME);
        }
        user_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join(APP_NAME))
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::env::temp_dir().join(APP_NAME)
    }
}

fn user_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

/// Engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Interval between statistics polls in milliseconds
    #[serde(default = "default_stats_poll_interval_ms")]
    pub stats_poll_interval_ms: u64,

    /// Capacity of the in-memory log ring
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Upstream connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stats_poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "stats_poll_interval_ms must be greater than 0".into(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "log_capacity must be greater than 0".into(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Get stats poll interval as Duration
    #[must_use]
    pub const fn stats_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stats_poll_interval_ms)
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stats_poll_interval_ms: default_stats_poll_interval_ms(),
            log_capacity: default_log_capacity(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Transport selection for local channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Unix socket on Unix, TCP loopback on Windows
    #[default]
    Auto,
    /// Unix domain socket
    Unix,
    /// TCP loopback with candidate ports
    Tcp,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "unix" => Ok(Self::Unix),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

impl TransportKind {
    /// Resolve `Auto` to the platform transport
    #[must_use]
    pub const fn resolve(self) -> Self {
        match self {
            Self::Auto => {
                if cfg!(unix) {
                    Self::Unix
                } else {
                    Self::Tcp
                }
            }
            other => other,
        }
    }
}

/// RPC transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Enable IPC server in the daemon
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Transport selection
    #[serde(default)]
    pub transport: TransportKind,

    /// Path to Unix socket
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Socket file mode (octal, e.g., 0o666)
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,

    /// Candidate loopback ports for the TCP transport
    #[serde(default = "default_ipc_ports")]
    pub tcp_ports: Vec<u16>,

    /// Port discovery files (machine-wide first, then per-user)
    #[serde(default = "default_port_files")]
    pub port_files: Vec<PathBuf>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_ipc_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl IpcConfig {
    /// Validate IPC configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.transport.resolve() {
            TransportKind::Unix => {
                if self.socket_path.as_os_str().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "IPC socket path cannot be empty for the unix transport".into(),
                    ));
                }
            }
            _ => {
                if self.tcp_ports.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "IPC tcp_ports cannot be empty for the tcp transport".into(),
                    ));
                }
            }
        }

        if self.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_message_size must be greater than 0".into(),
            ));
        }

        if self.connect_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "IPC timeouts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: TransportKind::Auto,
            socket_path: default_socket_path(),
            socket_mode: default_socket_mode(),
            tcp_ports: default_ipc_ports(),
            port_files: default_port_files(),
            connect_timeout_ms: default_ipc_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

/// Single-instance coordination
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Lock name; also names the lock file and wake-up socket
    #[serde(default = "default_instance_name")]
    pub name: String,

    /// Directory for the lock file and wake-up socket
    #[serde(default = "std::env::temp_dir")]
    pub lock_dir: PathBuf,

    /// Candidate loopback ports for the TCP wake-up channel
    #[serde(default = "default_wakeup_ports")]
    pub wakeup_ports: Vec<u16>,

    /// Wake-up channel transport
    #[serde(default)]
    pub wakeup_transport: TransportKind,
}

impl InstanceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "instance name cannot be empty".into(),
            ));
        }
        if self.name.contains(['/', '\\']) {
            return Err(ConfigError::ValidationError(format!(
                "instance name must not contain path separators: {}",
                self.name
            )));
        }
        if self.wakeup_transport.resolve() == TransportKind::Tcp && self.wakeup_ports.is_empty() {
            return Err(ConfigError::ValidationError(
                "wakeup_ports cannot be empty for the tcp wake-up channel".into(),
            ));
        }
        Ok(())
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: default_instance_name(),
            lock_dir: std::env::temp_dir(),
            wakeup_ports: default_wakeup_ports(),
            wakeup_transport: TransportKind::Auto,
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_stats_poll_interval_ms() -> u64 {
    2000
}

const fn default_log_capacity() -> usize {
    1000
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("{APP_NAME}.sock"))
}

const fn default_socket_mode() -> u32 {
    0o666
}

fn default_ipc_ports() -> Vec<u16> {
    DEFAULT_IPC_PORTS.to_vec()
}

fn default_port_files() -> Vec<PathBuf> {
    let mut files = vec![default_data_dir().join("ipc_port")];
    if let Some(dirs) = user_dirs() {
        let user = dirs.config_dir().join("ipc_port");
        if !files.contains(&user) {
            files.push(user);
        }
    }
    files
}

const fn default_ipc_connect_timeout_ms() -> u64 {
    5000
}

const fn default_call_timeout_ms() -> u64 {
    10_000
}

const fn default_max_message_size() -> usize {
    16 * 1024 * 1024
}

fn default_instance_name() -> String {
    APP_NAME.into()
}

fn default_wakeup_ports() -> Vec<u16> {
    DEFAULT_WAKEUP_PORTS.to_vec()
}
