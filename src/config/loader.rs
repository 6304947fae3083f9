//! Settings loading and management
//!
//! This module handles loading settings from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::{Settings, TransportKind};
use crate::error::ConfigError;

/// Load settings from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();

    debug!("Loading settings from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let settings: Settings = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    settings.validate()?;

    info!(
        "Settings loaded: ipc transport={:?}, instance={}",
        settings.ipc.transport, settings.instance.name
    );

    Ok(settings)
}

/// Load settings from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_settings_str(json: &str) -> Result<Settings, ConfigError> {
    let settings: Settings =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    settings.validate()?;

    Ok(settings)
}

/// Load settings with environment variable overrides
///
/// Environment variables:
/// - `PORTWARDEN_DATA_DIR`: Override the persistence directory
/// - `PORTWARDEN_LOG_LEVEL`: Override log level
/// - `PORTWARDEN_IPC_SOCKET`: Override IPC socket path
/// - `PORTWARDEN_IPC_TRANSPORT`: Override IPC transport (auto, unix, tcp)
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_settings_with_env(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let mut settings = load_settings(path)?;
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

/// Apply environment overrides to already-loaded settings
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparsable values.
pub fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(dir) = std::env::var("PORTWARDEN_DATA_DIR") {
        settings.data_dir = Some(dir.into());
        debug!("Data dir overridden to {:?}", settings.data_dir);
    }

    if let Ok(level) = std::env::var("PORTWARDEN_LOG_LEVEL") {
        settings.log.level = level;
        debug!("Log level overridden to {}", settings.log.level);
    }

    if let Ok(socket) = std::env::var("PORTWARDEN_IPC_SOCKET") {
        settings.ipc.socket_path = socket.into();
        debug!("IPC socket path overridden to {:?}", settings.ipc.socket_path);
    }

    if let Ok(transport) = std::env::var("PORTWARDEN_IPC_TRANSPORT") {
        settings.ipc.transport =
            transport
                .parse::<TransportKind>()
                .map_err(|reason| ConfigError::EnvError {
                    name: "PORTWARDEN_IPC_TRANSPORT".into(),
                    reason,
                })?;
        debug!("IPC transport overridden to {:?}", settings.ipc.transport);
    }

    // Re-validate after overrides
    settings.validate()
}

/// Create a default settings file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_settings(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let settings = Settings::default_config();
    let json = serde_json::to_string_pretty(&settings)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize settings: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
