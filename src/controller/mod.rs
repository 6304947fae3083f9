//! Service controller abstraction
//!
//! [`ServiceController`] is the single contract the GUI, the CLI and the
//! RPC handler program against. Two implementations exist:
//!
//! - [`LocalController`]: persistence via the [`Store`], lifecycle via an
//!   in-process [`Engine`]
//! - [`RemoteController`]: every call forwarded to a daemon over IPC
//!
//! [`connect_or_embed`] picks one once at startup: a successful `GetStatus`
//! round trip binds to the daemon, anything else embeds an engine. There is
//! no hot-swap afterwards.

mod local;
mod remote;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

pub use local::LocalController;
pub use remote::RemoteController;

use crate::config::Settings;
use crate::engine::Engine;
use crate::error::ControllerError;
use crate::forward::RelayBackend;
use crate::ipc::IpcClient;
use crate::logbuf::LogEntry;
use crate::model::{AppConfig, AppData, Chain, Rule, ServiceStatus};
use crate::stats::RuleStats;
use crate::store::Store;

/// Result type for controller operations
pub type ControllerResult<T> = std::result::Result<T, ControllerError>;

/// Which implementation a controller is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerMode {
    /// Engine runs in this process
    Local,
    /// Calls go to a daemon
    Remote,
}

impl fmt::Display for ControllerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Operations available regardless of where the engine runs
#[async_trait]
pub trait ServiceController: Send + Sync {
    fn mode(&self) -> ControllerMode;

    // Rules
    async fn get_rules(&self) -> ControllerResult<Vec<Rule>>;
    async fn get_rule(&self, id: &str) -> ControllerResult<Rule>;
    /// Persist a new rule; an empty id is assigned
    async fn create_rule(&self, rule: Rule) -> ControllerResult<Rule>;
    /// Persist changes, restarting the rule if it is enabled
    async fn update_rule(&self, rule: Rule) -> ControllerResult<()>;
    async fn delete_rule(&self, id: &str) -> ControllerResult<()>;
    async fn start_rule(&self, id: &str) -> ControllerResult<()>;
    /// Stop a rule; stopping a rule that is not running still marks it stopped
    async fn stop_rule(&self, id: &str) -> ControllerResult<()>;
    /// Enable and start every rule, returning the last failure
    async fn start_all_rules(&self) -> ControllerResult<()>;
    async fn stop_all_rules(&self) -> ControllerResult<()>;

    // Chains
    async fn get_chains(&self) -> ControllerResult<Vec<Chain>>;
    async fn get_chain(&self, id: &str) -> ControllerResult<Chain>;
    async fn create_chain(&self, chain: Chain) -> ControllerResult<Chain>;
    async fn update_chain(&self, chain: Chain) -> ControllerResult<()>;
    async fn delete_chain(&self, id: &str) -> ControllerResult<()>;

    // Config
    async fn get_config(&self) -> ControllerResult<AppConfig>;
    async fn update_config(&self, config: AppConfig) -> ControllerResult<()>;

    // Status and stats
    async fn get_status(&self) -> ControllerResult<ServiceStatus>;
    async fn get_rule_stats(&self, rule_id: &str) -> ControllerResult<RuleStats>;
    async fn get_all_rule_stats(&self) -> ControllerResult<HashMap<String, RuleStats>>;
    /// Zero one rule's counters, or all with `None`
    async fn reset_rule_stats(&self, rule_id: Option<&str>) -> ControllerResult<()>;

    // Logs
    /// Most recent `count` entries; 0 means all
    async fn get_logs(&self, count: usize) -> ControllerResult<Vec<LogEntry>>;
    async fn get_logs_since(&self, since_id: u64) -> ControllerResult<Vec<LogEntry>>;
    async fn get_logs_by_rule(&self, rule_id: &str) -> ControllerResult<Vec<LogEntry>>;
    async fn clear_logs(&self) -> ControllerResult<()>;

    // Bulk data
    /// Full data document as pretty JSON
    async fn export_data(&self) -> ControllerResult<String>;
    async fn import_data(&self, data: AppData, merge: bool) -> ControllerResult<()>;
    /// Remove every rule and chain, keeping the config
    async fn clear_all_data(&self) -> ControllerResult<()>;

    /// Release the controller
    async fn shutdown(&self) -> ControllerResult<()>;
}

/// Outcome of starting persisted rules at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub started: Vec<String>,
    /// `(rule_id, error message)`
    pub failed: Vec<(String, String)>,
}

/// Controller chosen at startup
#[derive(Clone)]
pub struct ControllerHandle {
    pub controller: Arc<dyn ServiceController>,
    pub mode: ControllerMode,
    /// Startup report when the engine was embedded
    pub init_report: Option<InitReport>,
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("mode", &self.mode)
            .field("init_report", &self.init_report)
            .finish_non_exhaustive()
    }
}

/// Bind to a running daemon if one answers, otherwise embed an engine
///
/// # Errors
///
/// Returns an error only if the embedded fallback cannot open its store.
pub async fn connect_or_embed(settings: &Settings) -> ControllerResult<ControllerHandle> {
    let remote = RemoteController::new(IpcClient::from_config(&settings.ipc));
    match remote.get_status().await {
        Ok(status) => {
            info!(
                "connected to daemon {} ({} of {} rules active)",
                status.version, status.rules_active, status.rules_total
            );
            return Ok(ControllerHandle {
                controller: Arc::new(remote),
                mode: ControllerMode::Remote,
                init_report: None,
            });
        }
        Err(e) => debug!("no daemon reachable, embedding engine: {}", e),
    }

    let (local, report) = embed(settings).await?;
    Ok(ControllerHandle {
        controller: Arc::new(local),
        mode: ControllerMode::Local,
        init_report: Some(report),
    })
}

/// Build store + engine + local controller and start persisted rules
///
/// # Errors
///
/// Returns [`ControllerError::Store`] if the data directory cannot be opened.
pub async fn embed(settings: &Settings) -> ControllerResult<(LocalController, InitReport)> {
    let data_dir = settings.resolve_data_dir();
    let store = Arc::new(Store::open(&data_dir)?);
    let backend = Arc::new(RelayBackend::new(settings.engine.connect_timeout()));
    let engine = Arc::new(Engine::new(backend, &settings.engine));

    let local = LocalController::new(store, engine);
    let report = local.init().await;
    if !report.failed.is_empty() {
        warn!(
            "{} rules failed to start: {:?}",
            report.failed.len(),
            report.failed
        );
    }
    info!(
        "embedded engine ready ({} rules started, data in {:?})",
        report.started.len(),
        data_dir
    );
    Ok((local, report))
}
