//! Configuration module for portwarden
//!
//! This module provides process settings types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use portwarden::config::{load_settings, Settings};
//!
//! let settings = load_settings("/etc/portwarden/settings.json").unwrap();
//! println!("Data dir: {:?}", settings.resolve_data_dir());
//! ```

mod loader;
mod types;

pub use loader::{
    apply_env_overrides, create_default_settings, load_settings, load_settings_str,
    load_settings_with_env,
};
pub use types::{
    default_data_dir, EngineConfig, InstanceConfig, IpcConfig, LogConfig, Settings, TransportKind,
    APP_NAME, DEFAULT_IPC_PORTS, DEFAULT_WAKEUP_PORTS,
};
