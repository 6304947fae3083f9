//! Background service composition
//!
//! The daemon owns the authoritative [`Engine`]: store, engine and local
//! controller are wired together here and exposed over the IPC server. The
//! RPC handler dispatches to the same [`LocalController`] an embedded
//! process would use.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::controller::{InitReport, LocalController, ServiceController};
use crate::engine::Engine;
use crate::error::PortwardenError;
use crate::forward::RelayBackend;
use crate::ipc::{IpcEndpoint, IpcHandler, IpcServer};
use crate::store::Store;

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Store + engine + local controller + IPC server
pub struct Daemon {
    controller: Arc<LocalController>,
    server: Option<Arc<IpcServer>>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("controller", &self.controller)
            .field("endpoint", &self.server.as_ref().map(|s| s.endpoint().to_string()))
            .finish()
    }
}

impl Daemon {
    /// Build the daemon; must be called inside a tokio runtime
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be opened.
    pub fn new(settings: &Settings) -> Result<Self, PortwardenError> {
        let data_dir = settings.resolve_data_dir();
        let store = Arc::new(Store::open(&data_dir)?);
        info!("data directory: {:?}", data_dir);

        let backend = Arc::new(RelayBackend::new(settings.engine.connect_timeout()));
        let engine = Arc::new(Engine::new(backend, &settings.engine));
        let controller = Arc::new(LocalController::new(store, engine));

        let server = if settings.ipc.enabled {
            let handler = Arc::new(IpcHandler::new(
                Arc::clone(&controller) as Arc<dyn ServiceController>
            ));
            Some(Arc::new(IpcServer::new(
                IpcEndpoint::from_config(&settings.ipc),
                handler,
                settings.ipc.max_message_size,
            )))
        } else {
            None
        };

        Ok(Self { controller, server })
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<LocalController> {
        &self.controller
    }

    #[must_use]
    pub fn server(&self) -> Option<&Arc<IpcServer>> {
        self.server.as_ref()
    }

    /// Serve RPC, start persisted rules, and run until `shutdown` fires
    ///
    /// An RPC bind failure does not stop the daemon: configured rules keep
    /// forwarding without remote control.
    pub async fn run(&self, shutdown: CancellationToken) -> InitReport {
        let server_task = match &self.server {
            Some(server) => match server.bind().await {
                Ok(listener) => {
                    info!("IPC server listening on {}", server.endpoint());
                    let server = Arc::clone(server);
                    Some(tokio::spawn(async move { server.serve(listener).await }))
                }
                Err(e) => {
                    warn!(
                        "IPC server unavailable, running in degraded mode without remote control: {}",
                        e
                    );
                    None
                }
            },
            None => {
                info!("IPC disabled");
                None
            }
        };

        let report = self.controller.init().await;
        info!(
            "daemon started: {} rules running, {} failed",
            report.started.len(),
            report.failed.len()
        );
        for (rule_id, message) in &report.failed {
            warn!(rule_id = %rule_id, "rule failed to start: {}", message);
        }

        shutdown.cancelled().await;
        info!("daemon shutting down");

        if let Err(e) = self.controller.shutdown().await {
            error!("controller shutdown failed: {}", e);
        }
        if let Some(server) = &self.server {
            server.shutdown();
        }
        if let Some(task) = server_task {
            if tokio::time::timeout(SERVER_STOP_TIMEOUT, task).await.is_err() {
                warn!("IPC server did not stop within {:?}", SERVER_STOP_TIMEOUT);
            }
        }

        info!("daemon stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_without_ipc_stops_on_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.data_dir = Some(dir.path().to_path_buf());
        settings.ipc.enabled = false;

        let daemon = Arc::new(Daemon::new(&settings).unwrap());
        assert!(daemon.server().is_none());

        let token = CancellationToken::new();
        let runner = {
            let daemon = Arc::clone(&daemon);
            let token = token.clone();
            tokio::spawn(async move { daemon.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let report = runner.await.unwrap();
        assert!(report.started.is_empty());
        assert_eq!(daemon.controller().engine().running_count(), 0);
    }
}
