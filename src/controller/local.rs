//! Embedded controller: store + in-process engine

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ControllerMode, ControllerResult, InitReport, ServiceController};
use crate::engine::Engine;
use crate::error::{ControllerError, EngineError, StoreError};
use crate::logbuf::LogEntry;
use crate::model::{AppConfig, AppData, Chain, Rule, RuleStatus, ServiceStatus};
use crate::stats::RuleStats;
use crate::store::Store;

/// Controller driving a local [`Engine`] and keeping the [`Store`] in sync
///
/// Store writes run on the blocking pool. After [`shutdown`] every
/// mutating call fails with [`ControllerError::ShuttingDown`]; reads keep
/// working.
///
/// [`shutdown`]: ServiceController::shutdown
pub struct LocalController {
    store: Arc<Store>,
    engine: Arc<Engine>,
    started_at: DateTime<Utc>,
    closed: AtomicBool,
    status_sync: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalController")
            .field("engine", &self.engine)
            .field("started_at", &self.started_at)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Run a store operation on the blocking pool
async fn persist<T, F>(store: &Arc<Store>, op: F) -> ControllerResult<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&store))
        .await
        .map_err(|e| ControllerError::failed(format!("store task failed: {e}")))?
        .map_err(ControllerError::from)
}

impl LocalController {
    pub fn new(store: Arc<Store>, engine: Arc<Engine>) -> Self {
        Self {
            store,
            engine,
            started_at: Utc::now(),
            closed: AtomicBool::new(false),
            status_sync: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Load chains into the engine, install status sync, start enabled rules
    ///
    /// Rules that are disabled but persisted as `running` (left over from an
    /// unclean exit) are reset to `stopped`.
    pub async fn init(&self) -> InitReport {
        self.engine.set_chains(self.store.chains());
        self.install_status_sync();

        let mut report = InitReport::default();
        for rule in self.store.rules() {
            if !rule.enabled {
                if rule.status == RuleStatus::Running {
                    self.record_status(&rule.id, RuleStatus::Stopped, "").await;
                }
                continue;
            }

            match self.engine.start_rule(&rule) {
                Ok(()) | Err(EngineError::AlreadyRunning { .. }) => {
                    self.record_status(&rule.id, RuleStatus::Running, "").await;
                    report.started.push(rule.id);
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, "failed to start rule: {}", e);
                    let msg = e.to_string();
                    self.record_status(&rule.id, RuleStatus::Error, &msg).await;
                    report.failed.push((rule.id, msg));
                }
            }
        }

        info!(
            "controller initialized: {} started, {} failed",
            report.started.len(),
            report.failed.len()
        );
        report
    }

    /// Persist autonomous engine transitions (fatal errors, service exits)
    fn install_status_sync(&self) {
        let mut slot = self.status_sync.lock();
        if slot.is_some() {
            return;
        }

        let mut events = self.engine.subscribe_status();
        let store = Arc::clone(&self.store);
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(rule_id = %event.rule_id, "status change: {}", event.status);
                let msg = event.error.unwrap_or_default();
                let rule_id = event.rule_id.clone();
                let result = persist(&store, move |s| {
                    s.update_rule_status(&event.rule_id, event.status, msg)
                })
                .await;
                if let Err(e) = result {
                    debug!(rule_id = %rule_id, "status sync skipped: {}", e);
                }
            }
        }));
    }

    fn ensure_open(&self) -> ControllerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControllerError::ShuttingDown);
        }
        Ok(())
    }

    async fn record_status(&self, rule_id: &str, status: RuleStatus, msg: &str) {
        let (id, msg) = (rule_id.to_string(), msg.to_string());
        if let Err(e) = persist(&self.store, move |s| s.update_rule_status(&id, status, msg)).await
        {
            warn!(rule_id = %rule_id, "failed to persist status {}: {}", status, e);
        }
    }

    async fn record_state(&self, rule_id: &str, enabled: bool, status: RuleStatus) {
        let id = rule_id.to_string();
        if let Err(e) = persist(&self.store, move |s| {
            s.update_rule_state(&id, enabled, status, "")
        })
        .await
        {
            warn!(rule_id = %rule_id, "failed to persist state {}: {}", status, e);
        }
    }

    /// Stop a rule if it is running; absence is fine
    fn stop_if_running(&self, rule_id: &str) {
        match self.engine.stop_rule(rule_id) {
            Ok(()) | Err(EngineError::NotRunning { .. }) => {}
            Err(e) => warn!(rule_id = %rule_id, "stop failed: {}", e),
        }
    }

    fn stop_running(&self) {
        for id in self.engine.running_rule_ids() {
            self.stop_if_running(&id);
        }
    }

    /// Drop statistics of rules that no longer exist in the store
    fn forget_removed(&self, before: &[String]) {
        let remaining: Vec<String> = self.store.rules().into_iter().map(|r| r.id).collect();
        for id in before.iter().filter(|id| !remaining.contains(id)) {
            self.engine.forget_rule(id);
        }
    }

    fn rule_ids(&self) -> Vec<String> {
        self.store.rules().into_iter().map(|r| r.id).collect()
    }

    /// (Re)start every enabled rule after an import
    async fn start_enabled(&self) {
        for rule in self.store.rules().into_iter().filter(|r| r.enabled) {
            match self.engine.restart_rule(&rule) {
                Ok(()) => self.record_status(&rule.id, RuleStatus::Running, "").await,
                Err(e) => {
                    warn!(rule_id = %rule.id, "failed to start imported rule: {}", e);
                    self.record_status(&rule.id, RuleStatus::Error, &e.to_string())
                        .await;
                }
            }
        }
    }
}

#[async_trait]
impl ServiceController for LocalController {
    fn mode(&self) -> ControllerMode {
        ControllerMode::Local
    }

    async fn get_rules(&self) -> ControllerResult<Vec<Rule>> {
        Ok(self.store.rules())
    }

    async fn get_rule(&self, id: &str) -> ControllerResult<Rule> {
        Ok(self.store.rule(id)?)
    }

    async fn create_rule(&self, rule: Rule) -> ControllerResult<Rule> {
        self.ensure_open()?;
        persist(&self.store, move |s| s.create_rule(rule)).await
    }

    async fn update_rule(&self, rule: Rule) -> ControllerResult<()> {
        self.ensure_open()?;
        self.stop_if_running(&rule.id);

        let rule = persist(&self.store, move |s| s.update_rule(rule)).await?;
        if !rule.enabled {
            self.record_status(&rule.id, RuleStatus::Stopped, "").await;
            return Ok(());
        }

        match self.engine.start_rule(&rule) {
            Ok(()) => {
                self.record_status(&rule.id, RuleStatus::Running, "").await;
                Ok(())
            }
            Err(e) => {
                self.record_status(&rule.id, RuleStatus::Error, &e.to_string())
                    .await;
                Err(e.into())
            }
        }
    }

    async fn delete_rule(&self, id: &str) -> ControllerResult<()> {
        self.ensure_open()?;
        self.stop_if_running(id);
        let owned = id.to_string();
        persist(&self.store, move |s| s.delete_rule(&owned)).await?;
        self.engine.forget_rule(id);
        Ok(())
    }

    async fn start_rule(&self, id: &str) -> ControllerResult<()> {
        self.ensure_open()?;
        let rule = self.store.rule(id)?;
        match self.engine.start_rule(&rule) {
            Ok(()) => {
                self.record_state(id, true, RuleStatus::Running).await;
                Ok(())
            }
            Err(e @ EngineError::AlreadyRunning { .. }) => {
                self.record_state(id, true, RuleStatus::Running).await;
                Err(e.into())
            }
            Err(e) => {
                self.record_status(id, RuleStatus::Error, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn stop_rule(&self, id: &str) -> ControllerResult<()> {
        self.ensure_open()?;
        // the rule must exist even if it is not running
        self.store.rule(id)?;
        self.stop_if_running(id);
        let owned = id.to_string();
        persist(&self.store, move |s| {
            s.update_rule_state(&owned, false, RuleStatus::Stopped, "")
        })
        .await
    }

    async fn start_all_rules(&self) -> ControllerResult<()> {
        self.ensure_open()?;
        let mut last_err: Option<ControllerError> = None;

        for mut rule in self.store.rules() {
            if !rule.enabled {
                rule.enabled = true;
                rule = persist(&self.store, move |s| s.update_rule(rule)).await?;
            }

            match self.engine.start_rule(&rule) {
                Ok(()) | Err(EngineError::AlreadyRunning { .. }) => {
                    self.record_status(&rule.id, RuleStatus::Running, "").await;
                }
                Err(e) => {
                    self.record_status(&rule.id, RuleStatus::Error, &e.to_string())
                        .await;
                    last_err = Some(e.into());
                }
            }
        }

        last_err.map_or(Ok(()), Err)
    }

    async fn stop_all_rules(&self) -> ControllerResult<()> {
        self.ensure_open()?;
        for rule in self.store.rules() {
            self.stop_if_running(&rule.id);
            self.record_status(&rule.id, RuleStatus::Stopped, "").await;
        }
        Ok(())
    }

    async fn get_chains(&self) -> ControllerResult<Vec<Chain>> {
        Ok(self.store.chains())
    }

    async fn get_chain(&self, id: &str) -> ControllerResult<Chain> {
        Ok(self.store.chain(id)?)
    }

    async fn create_chain(&self, chain: Chain) -> ControllerResult<Chain> {
        self.ensure_open()?;
        chain.validate()?;
        let chain = persist(&self.store, move |s| s.create_chain(chain)).await?;
        self.engine.set_chains(self.store.chains());
        Ok(chain)
    }

    async fn update_chain(&self, chain: Chain) -> ControllerResult<()> {
        self.ensure_open()?;
        chain.validate()?;
        persist(&self.store, move |s| s.update_chain(chain)).await?;
        self.engine.set_chains(self.store.chains());
        Ok(())
    }

    async fn delete_chain(&self, id: &str) -> ControllerResult<()> {
        self.ensure_open()?;
        let owned = id.to_string();
        persist(&self.store, move |s| s.delete_chain(&owned)).await?;
        self.engine.set_chains(self.store.chains());
        Ok(())
    }

    async fn get_config(&self) -> ControllerResult<AppConfig> {
        Ok(self.store.config())
    }

    async fn update_config(&self, config: AppConfig) -> ControllerResult<()> {
        self.ensure_open()?;
        persist(&self.store, move |s| s.update_config(config)).await
    }

    async fn get_status(&self) -> ControllerResult<ServiceStatus> {
        Ok(ServiceStatus {
            running: !self.closed.load(Ordering::Acquire),
            pid: Some(std::process::id()),
            start_time: Some(self.started_at.to_rfc3339()),
            rules_active: self.engine.running_count(),
            rules_total: self.store.rule_count(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    async fn get_rule_stats(&self, rule_id: &str) -> ControllerResult<RuleStats> {
        Ok(self.engine.rule_stats(rule_id))
    }

    async fn get_all_rule_stats(&self) -> ControllerResult<HashMap<String, RuleStats>> {
        Ok(self.engine.all_stats())
    }

    async fn reset_rule_stats(&self, rule_id: Option<&str>) -> ControllerResult<()> {
        self.engine.reset_stats(rule_id);
        Ok(())
    }

    async fn get_logs(&self, count: usize) -> ControllerResult<Vec<LogEntry>> {
        Ok(self.engine.logs().get_recent(count))
    }

    async fn get_logs_since(&self, since_id: u64) -> ControllerResult<Vec<LogEntry>> {
        Ok(self.engine.logs().get_since(since_id))
    }

    async fn get_logs_by_rule(&self, rule_id: &str) -> ControllerResult<Vec<LogEntry>> {
        Ok(self.engine.logs().get_by_rule(rule_id))
    }

    async fn clear_logs(&self) -> ControllerResult<()> {
        self.engine.logs().clear();
        Ok(())
    }

    async fn export_data(&self) -> ControllerResult<String> {
        Ok(self.store.export_data()?)
    }

    async fn import_data(&self, data: AppData, merge: bool) -> ControllerResult<()> {
        self.ensure_open()?;
        let before = self.rule_ids();
        if !merge {
            self.stop_running();
        }
        persist(&self.store, move |s| s.import_data(data, merge)).await?;
        self.forget_removed(&before);
        self.engine.set_chains(self.store.chains());
        self.start_enabled().await;
        Ok(())
    }

    async fn clear_all_data(&self) -> ControllerResult<()> {
        self.ensure_open()?;
        let before = self.rule_ids();
        self.stop_running();
        let empty = AppData::with_config(self.store.config());
        persist(&self.store, move |s| s.import_data(empty, false)).await?;
        self.forget_removed(&before);
        self.engine.set_chains(Vec::new());
        Ok(())
    }

    async fn shutdown(&self) -> ControllerResult<()> {
        self.closed.store(true, Ordering::Release);
        self.engine.stop_all();
        if let Some(task) = self.status_sync.lock().take() {
            task.abort();
        }
        Ok(())
    }
}
