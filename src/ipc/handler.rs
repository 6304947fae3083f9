//! IPC command handler
//!
//! Maps each [`IpcCommand`] onto the matching [`ServiceController`] call.
//! Business failures become [`IpcResponse::Error`] with the controller's
//! error code, so the client sees them as failed replies rather than
//! transport faults.

use std::sync::Arc;

use tracing::debug;

use super::protocol::{IpcCommand, IpcResponse};
use crate::controller::ServiceController;
use crate::error::ControllerError;

/// Dispatches commands to a controller
pub struct IpcHandler {
    controller: Arc<dyn ServiceController>,
}

impl std::fmt::Debug for IpcHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHandler")
            .field("mode", &self.controller.mode())
            .finish()
    }
}

impl IpcHandler {
    pub fn new(controller: Arc<dyn ServiceController>) -> Self {
        Self { controller }
    }

    /// Handle one command
    pub async fn handle(&self, command: IpcCommand) -> IpcResponse {
        let method = command.method();
        match self.dispatch(command).await {
            Ok(response) => response,
            Err(e) => {
                debug!("IPC {} failed: {}", method, e);
                IpcResponse::error(e.code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, command: IpcCommand) -> Result<IpcResponse, ControllerError> {
        let c = &self.controller;
        let response = match command {
            IpcCommand::Ping => IpcResponse::Pong,
            IpcCommand::GetStatus => IpcResponse::Status {
                status: c.get_status().await?,
            },

            IpcCommand::GetRules => IpcResponse::Rules {
                rules: c.get_rules().await?,
            },
            IpcCommand::GetRule { id } => IpcResponse::Rule {
                rule: c.get_rule(&id).await?,
            },
            IpcCommand::CreateRule(args) => IpcResponse::Created {
                id: c.create_rule(args.rule).await?.id,
            },
            IpcCommand::UpdateRule(args) => {
                c.update_rule(args.rule).await?;
                IpcResponse::success()
            }
            IpcCommand::DeleteRule { id } => {
                c.delete_rule(&id).await?;
                IpcResponse::success()
            }
            IpcCommand::StartRule { id } => {
                c.start_rule(&id).await?;
                IpcResponse::success()
            }
            IpcCommand::StopRule { id } => {
                c.stop_rule(&id).await?;
                IpcResponse::success()
            }
            IpcCommand::StartAllRules => {
                c.start_all_rules().await?;
                IpcResponse::success()
            }
            IpcCommand::StopAllRules => {
                c.stop_all_rules().await?;
                IpcResponse::success()
            }

            IpcCommand::GetChains => IpcResponse::Chains {
                chains: c.get_chains().await?,
            },
            IpcCommand::GetChain { id } => IpcResponse::Chain {
                chain: c.get_chain(&id).await?,
            },
            IpcCommand::CreateChain(args) => IpcResponse::Created {
                id: c.create_chain(args.chain).await?.id,
            },
            IpcCommand::UpdateChain(args) => {
                c.update_chain(args.chain).await?;
                IpcResponse::success()
            }
            IpcCommand::DeleteChain { id } => {
                c.delete_chain(&id).await?;
                IpcResponse::success()
            }

            IpcCommand::GetConfig => IpcResponse::Config {
                config: c.get_config().await?,
            },
            IpcCommand::UpdateConfig { config } => {
                c.update_config(config).await?;
                IpcResponse::success()
            }

            IpcCommand::GetRuleStats(args) => IpcResponse::RuleStats {
                stats: c.get_rule_stats(&args.rule_id).await?,
            },
            IpcCommand::GetAllRuleStats => IpcResponse::AllRuleStats {
                stats: c.get_all_rule_stats().await?,
            },
            IpcCommand::ResetRuleStats { rule_id } => {
                c.reset_rule_stats(rule_id.as_deref()).await?;
                IpcResponse::success()
            }

            IpcCommand::GetLogs(args) => IpcResponse::Logs {
                logs: c.get_logs(args.count).await?,
            },
            IpcCommand::GetLogsSince(args) => IpcResponse::Logs {
                logs: c.get_logs_since(args.since_id).await?,
            },
            IpcCommand::GetLogsByRule(args) => IpcResponse::Logs {
                logs: c.get_logs_by_rule(&args.rule_id).await?,
            },
            IpcCommand::ClearLogs => {
                c.clear_logs().await?;
                IpcResponse::success()
            }

            IpcCommand::ExportData => IpcResponse::Data {
                data: c.export_data().await?,
            },
            IpcCommand::ImportData(args) => {
                c.import_data(args.data, args.merge).await?;
                IpcResponse::success()
            }
        };
        Ok(response)
    }
}
