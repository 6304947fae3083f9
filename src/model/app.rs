//! Application-level records: preferences, export document, service status

use serde::{Deserialize, Serialize};

use super::chain::Chain;
use super::rule::{Auth, Rule};

/// Persisted user preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// debug, info, warn, error
    pub log_level: String,
    /// Start enabled rules on launch
    pub auto_start: bool,
    pub start_minimized: bool,
    pub tray_enabled: bool,
    pub hotkey_enabled: bool,
    /// e.g. `cmd+shift`
    pub hotkey_modifiers: String,
    pub hotkey_key: String,
    /// Run rules in the background service
    pub service_enabled: bool,
    /// 0 selects the transport default
    pub service_port: u16,
    pub api_enabled: bool,
    pub api_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_auth: Option<Auth>,
    pub metrics_enabled: bool,
    pub metrics_addr: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            auto_start: true,
            start_minimized: false,
            tray_enabled: true,
            hotkey_enabled: true,
            hotkey_modifiers: "cmd+shift".into(),
            hotkey_key: "p".into(),
            service_enabled: false,
            service_port: 0,
            api_enabled: false,
            api_addr: ":18080".into(),
            api_auth: None,
            metrics_enabled: false,
            metrics_addr: ":9000".into(),
        }
    }
}

/// Everything that is persisted; also the export/import document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppData {
    pub config: AppConfig,
    pub rules: Vec<Rule>,
    pub chains: Vec<Chain>,
}

impl AppData {
    /// Empty rule set carrying the given preferences
    #[must_use]
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config,
            rules: Vec::new(),
            chains: Vec::new(),
        }
    }
}

/// Snapshot of the process running the rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// RFC 3339
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    pub rules_active: usize,
    pub rules_total: usize,
    pub version: String,
}
