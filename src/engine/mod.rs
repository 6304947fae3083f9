//! Rule lifecycle engine
//!
//! The [`Engine`] is the authoritative in-process supervisor of running
//! rules. It asks a [`ForwardBackend`] to build a service for each started
//! rule, runs the service's serve loop as a task, and classifies the loop's
//! exit:
//!
//! | Exit                                   | Effect                            |
//! |----------------------------------------|-----------------------------------|
//! | cancellation token already triggered   | intentional stop, silent          |
//! | `Ok(())` / [`ServeError::Closed`]      | entry removed, `stopped` event    |
//! | fatal ([`ServeError::is_fatal`])       | entry removed, `error` event      |
//! | anything else                          | logged, entry kept                |
//!
//! # Lock Ordering
//!
//! 1. `stats_gate` (`Mutex`) - serializes polling against resets
//! 2. `services` (`RwLock`) - running-entry registry
//! 3. `chains` (`RwLock`) - read while building a chained rule
//!
//! Status subscribers are only invoked with no engine lock held. The
//! observer callback may run under `stats_gate`, never under `services`.
//!
//! A service is closed while `services` is still write-locked, so a closed
//! instance can no longer publish stats once the same rule id can be
//! started again.
//!
//! # Status events
//!
//! [`Engine::subscribe_status`] hands out an unbounded receiver. Every
//! autonomous transition is sent to every live subscriber: at-least-once,
//! asynchronous, with no ordering guarantee relative to the call that
//! triggered it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ServeError};
use crate::forward::{BuildContext, ForwardBackend, ForwardService};
use crate::logbuf::LogBuffer;
use crate::model::{Chain, Rule, RuleStatus};
use crate::stats::{RuleStats, StatsObserver, StatsTracker};

/// Autonomous rule status change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub rule_id: String,
    pub status: RuleStatus,
    /// Error message for [`RuleStatus::Error`]
    pub error: Option<String>,
}

struct ServiceEntry {
    service: Arc<dyn ForwardService>,
    cancel: CancellationToken,
    rule: Rule,
    generation: u64,
}

struct Inner {
    services: RwLock<HashMap<String, ServiceEntry>>,
    chains: RwLock<Vec<Chain>>,
    backend: Arc<dyn ForwardBackend>,
    tracker: Arc<StatsTracker>,
    observer: Arc<StatsObserver>,
    logs: Arc<LogBuffer>,
    subscribers: Mutex<Vec<UnboundedSender<StatusEvent>>>,
    generation: AtomicU64,
    stats_gate: Mutex<()>,
    poll_cancel: CancellationToken,
    runtime: Handle,
}

/// Supervisor of running rule instances
pub struct Engine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.inner.services.read().len())
            .field("chains", &self.inner.chains.read().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine on the current tokio runtime and start the stats poller
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(backend: Arc<dyn ForwardBackend>, config: &EngineConfig) -> Self {
        Self::with_runtime(backend, config, Handle::current())
    }

    /// Create an engine that spawns onto `runtime`
    ///
    /// All engine operations are synchronous, so an engine built this way
    /// can be driven from plain OS threads.
    pub fn with_runtime(
        backend: Arc<dyn ForwardBackend>,
        config: &EngineConfig,
        runtime: Handle,
    ) -> Self {
        let tracker = Arc::new(StatsTracker::new());
        let observer = Arc::new(StatsObserver::new());

        {
            let tracker = Arc::clone(&tracker);
            observer.set_on_update(Arc::new(move |rule_id, stats| {
                tracker.update_from_observer(rule_id, &stats);
            }));
        }

        let inner = Arc::new(Inner {
            services: RwLock::new(HashMap::new()),
            chains: RwLock::new(Vec::new()),
            backend,
            tracker,
            observer,
            logs: Arc::new(LogBuffer::new(config.log_capacity)),
            subscribers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            stats_gate: Mutex::new(()),
            poll_cancel: CancellationToken::new(),
            runtime,
        });

        Self::spawn_poller(&inner, config);
        Self { inner }
    }

    fn spawn_poller(inner: &Arc<Inner>, config: &EngineConfig) {
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let cancel = inner.poll_cancel.clone();
        let period = config.stats_poll_interval();

        inner.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.collect_stats();
                    }
                }
            }
            debug!("stats poller stopped");
        });
    }

    /// Start serving a rule
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyRunning`] if an entry exists for `rule.id`
    /// - [`EngineError::Invalid`] if the rule fails validation
    /// - [`EngineError::ChainNotFound`] if the referenced chain is unknown
    /// - [`EngineError::Build`] if the backend cannot build the service
    pub fn start_rule(&self, rule: &Rule) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut services = inner.services.write();

        if services.contains_key(&rule.id) {
            return Err(EngineError::already_running(&rule.id));
        }

        rule.validate().map_err(|source| EngineError::Invalid {
            rule_id: rule.id.clone(),
            source,
        })?;

        let chain = match rule.chain_ref() {
            Some(chain_id) => Some(
                inner
                    .chains
                    .read()
                    .iter()
                    .find(|c| c.id == chain_id)
                    .cloned()
                    .ok_or_else(|| EngineError::ChainNotFound {
                        rule_id: rule.id.clone(),
                        chain_id: chain_id.to_string(),
                    })?,
            ),
            None => None,
        };

        let ctx = BuildContext {
            observer: Arc::clone(&inner.observer),
            logs: Arc::clone(&inner.logs),
        };
        let service = inner
            .backend
            .build(rule, chain.as_ref(), &ctx)
            .map_err(|source| EngineError::Build {
                rule_id: rule.id.clone(),
                op: "build service",
                source,
            })?;

        let cancel = CancellationToken::new();
        let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
        services.insert(
            rule.id.clone(),
            ServiceEntry {
                service: Arc::clone(&service),
                cancel: cancel.clone(),
                rule: rule.clone(),
                generation,
            },
        );
        drop(services);

        inner.tracker.init_rule(&rule.id);

        let listen = service
            .listen_addr()
            .map_or_else(|| rule.listen_addr().to_string(), |addr| addr.to_string());
        info!(rule_id = %rule.id, name = %rule.name, "rule started on {}", listen);
        inner.logs.log_service_start(rule, &listen);

        let task_inner = Arc::clone(inner);
        let task_rule = rule.clone();
        inner.runtime.spawn(async move {
            let result = service.serve(cancel.clone()).await;
            task_inner.on_serve_exit(&task_rule, generation, &cancel, result);
        });

        Ok(())
    }

    /// Stop a running rule
    ///
    /// Close failures are logged and swallowed; cancellation is authoritative.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotRunning`] if no entry exists for `rule_id`.
    pub fn stop_rule(&self, rule_id: &str) -> Result<(), EngineError> {
        let entry = {
            let mut services = self.inner.services.write();
            let entry = services
                .remove(rule_id)
                .ok_or_else(|| EngineError::not_running(rule_id))?;
            self.inner.shutdown_entry(&entry);
            entry
        };

        info!(rule_id = %rule_id, "rule stopped");
        self.inner.logs.log_service_stop(&entry.rule);
        Ok(())
    }

    /// Stop (if running) and start again
    ///
    /// # Errors
    ///
    /// Returns any error from [`Engine::start_rule`].
    pub fn restart_rule(&self, rule: &Rule) -> Result<(), EngineError> {
        match self.stop_rule(&rule.id) {
            Ok(()) | Err(EngineError::NotRunning { .. }) => {}
            Err(e) => return Err(e),
        }
        self.start_rule(rule)
    }

    /// Stop the stats poller and every running rule; idempotent
    pub fn stop_all(&self) {
        self.inner.poll_cancel.cancel();

        let entries: Vec<ServiceEntry> = {
            let mut services = self.inner.services.write();
            let entries: Vec<ServiceEntry> = services.drain().map(|(_, entry)| entry).collect();
            for entry in &entries {
                self.inner.shutdown_entry(entry);
            }
            entries
        };
        if entries.is_empty() {
            return;
        }

        info!("stopped {} running rules", entries.len());
        for entry in &entries {
            self.inner.logs.log_service_stop(&entry.rule);
        }
    }

    #[must_use]
    pub fn is_running(&self, rule_id: &str) -> bool {
        self.inner.services.read().contains_key(rule_id)
    }

    /// Ids of running rules, sorted
    #[must_use]
    pub fn running_rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.services.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.services.read().len()
    }

    /// Replace the chain set used when building chained rules
    ///
    /// Running rules keep the chain they were started with.
    pub fn set_chains(&self, chains: Vec<Chain>) {
        *self.inner.chains.write() = chains;
    }

    #[must_use]
    pub fn chains(&self) -> Vec<Chain> {
        self.inner.chains.read().clone()
    }

    /// Register for autonomous status changes
    pub fn subscribe_status(&self) -> UnboundedReceiver<StatusEvent> {
        let (tx, rx) = unbounded_channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Poll every running service once and feed the stats pipeline
    pub fn collect_stats(&self) {
        self.inner.collect_stats();
    }

    #[must_use]
    pub fn rule_stats(&self, rule_id: &str) -> RuleStats {
        self.inner.tracker.get_stats(rule_id)
    }

    #[must_use]
    pub fn all_stats(&self) -> HashMap<String, RuleStats> {
        self.inner.tracker.get_all_stats()
    }

    /// Zero one rule's counters, or every rule's with `None`
    ///
    /// Running services are republished afterwards so live connection
    /// counts survive the reset.
    pub fn reset_stats(&self, rule_id: Option<&str>) {
        let inner = &self.inner;
        let _gate = inner.stats_gate.lock();

        let services = inner.running_services(rule_id);
        for (_, service) in &services {
            service.reset_stats();
        }
        match rule_id {
            Some(id) => {
                inner.observer.reset_stats(id);
                inner.tracker.reset_stats(id);
            }
            None => {
                inner.observer.reset_all_stats();
                inner.tracker.reset_all_stats();
            }
        }
        for (id, service) in &services {
            service.publish_stats(id, &inner.observer);
        }
    }

    /// Drop the retained statistics of a deleted rule
    pub fn forget_rule(&self, rule_id: &str) {
        let _gate = self.inner.stats_gate.lock();
        self.inner.observer.remove_stats(rule_id);
        self.inner.tracker.remove_rule(rule_id);
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<StatsTracker> {
        &self.inner.tracker
    }

    #[must_use]
    pub fn observer(&self) -> &Arc<StatsObserver> {
        &self.inner.observer
    }

    #[must_use]
    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.inner.logs
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_all();
    }
}

impl Inner {
    fn shutdown_entry(&self, entry: &ServiceEntry) {
        entry.cancel.cancel();
        if let Err(e) = entry.service.close() {
            debug!(rule_id = %entry.rule.id, "close after cancel failed: {}", e);
        }
    }

    /// Remove and close the entry only if it still belongs to the exiting
    /// serve loop
    fn remove_generation(&self, rule_id: &str, generation: u64) -> Option<ServiceEntry> {
        let mut services = self.services.write();
        let entry = match services.get(rule_id) {
            Some(entry) if entry.generation == generation => services.remove(rule_id)?,
            _ => return None,
        };
        self.shutdown_entry(&entry);
        Some(entry)
    }

    fn running_services(&self, rule_id: Option<&str>) -> Vec<(String, Arc<dyn ForwardService>)> {
        let services = self.services.read();
        match rule_id {
            Some(id) => services
                .get(id)
                .map(|entry| vec![(id.to_string(), Arc::clone(&entry.service))])
                .unwrap_or_default(),
            None => services
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.service)))
                .collect(),
        }
    }

    fn on_serve_exit(
        &self,
        rule: &Rule,
        generation: u64,
        cancel: &CancellationToken,
        result: Result<(), ServeError>,
    ) {
        if cancel.is_cancelled() {
            debug!(rule_id = %rule.id, "serve loop exited after cancellation");
            return;
        }

        match result {
            Ok(()) | Err(ServeError::Closed) => {
                if self.remove_generation(&rule.id, generation).is_some() {
                    info!(rule_id = %rule.id, "rule stopped by its service");
                    self.logs.log_service_stop(rule);
                    self.emit(StatusEvent {
                        rule_id: rule.id.clone(),
                        status: RuleStatus::Stopped,
                        error: None,
                    });
                }
            }
            Err(e) if e.is_fatal() => {
                if self.remove_generation(&rule.id, generation).is_some() {
                    error!(rule_id = %rule.id, "rule failed: {}", e);
                    self.logs.log_error(rule, &e);
                    self.emit(StatusEvent {
                        rule_id: rule.id.clone(),
                        status: RuleStatus::Error,
                        error: Some(e.to_string()),
                    });
                }
            }
            Err(e) => {
                warn!(rule_id = %rule.id, "service error: {}", e);
                self.logs.log_error(rule, &e);
            }
        }
    }

    fn emit(&self, event: StatusEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn collect_stats(&self) {
        let _gate = self.stats_gate.lock();
        for (rule_id, service) in self.running_services(None) {
            service.publish_stats(&rule_id, &self.observer);
        }
    }
}
