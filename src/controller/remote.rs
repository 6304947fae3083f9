//! Controller forwarding every call to a daemon

use std::collections::HashMap;

use async_trait::async_trait;

use super::{ControllerMode, ControllerResult, ServiceController};
use crate::error::IpcError;
use crate::ipc::{
    CreateChainArgs, CreateRuleArgs, GetLogsArgs, GetLogsByRuleArgs, GetLogsSinceArgs,
    ImportDataArgs, IpcClient, IpcCommand, IpcResponse, RuleStatsArgs,
};
use crate::logbuf::LogEntry;
use crate::model::{AppConfig, AppData, Chain, Rule, ServiceStatus};
use crate::stats::RuleStats;

/// [`ServiceController`] backed by an [`IpcClient`]
#[derive(Debug)]
pub struct RemoteController {
    client: IpcClient,
}

fn unexpected(method: &str, response: &IpcResponse) -> IpcError {
    IpcError::protocol(format!("unexpected response to {method}: {response:?}"))
}

impl RemoteController {
    pub fn new(client: IpcClient) -> Self {
        Self { client }
    }

    #[must_use]
    pub const fn client(&self) -> &IpcClient {
        &self.client
    }

    /// Send a command whose only expected answer is `Success`
    async fn call_unit(&self, command: IpcCommand) -> ControllerResult<()> {
        let method = command.method();
        match self.client.send(command).await? {
            IpcResponse::Success { .. } => Ok(()),
            other => Err(unexpected(method, &other).into()),
        }
    }

    async fn call_logs(&self, command: IpcCommand) -> ControllerResult<Vec<LogEntry>> {
        let method = command.method();
        match self.client.send(command).await? {
            IpcResponse::Logs { logs } => Ok(logs),
            other => Err(unexpected(method, &other).into()),
        }
    }

    async fn call_created(&self, command: IpcCommand) -> ControllerResult<String> {
        let method = command.method();
        match self.client.send(command).await? {
            IpcResponse::Created { id } => Ok(id),
            other => Err(unexpected(method, &other).into()),
        }
    }
}

#[async_trait]
impl ServiceController for RemoteController {
    fn mode(&self) -> ControllerMode {
        ControllerMode::Remote
    }

    async fn get_rules(&self) -> ControllerResult<Vec<Rule>> {
        match self.client.send(IpcCommand::GetRules).await? {
            IpcResponse::Rules { rules } => Ok(rules),
            other => Err(unexpected("get_rules", &other).into()),
        }
    }

    async fn get_rule(&self, id: &str) -> ControllerResult<Rule> {
        let command = IpcCommand::GetRule { id: id.to_string() };
        match self.client.send(command).await? {
            IpcResponse::Rule { rule } => Ok(rule),
            other => Err(unexpected("get_rule", &other).into()),
        }
    }

    async fn create_rule(&self, rule: Rule) -> ControllerResult<Rule> {
        let id = self
            .call_created(IpcCommand::CreateRule(CreateRuleArgs { rule }))
            .await?;
        self.get_rule(&id).await
    }

    async fn update_rule(&self, rule: Rule) -> ControllerResult<()> {
        self.call_unit(IpcCommand::UpdateRule(CreateRuleArgs { rule }))
            .await
    }

    async fn delete_rule(&self, id: &str) -> ControllerResult<()> {
        self.call_unit(IpcCommand::DeleteRule { id: id.to_string() })
            .await
    }

    async fn start_rule(&self, id: &str) -> ControllerResult<()> {
        self.call_unit(IpcCommand::StartRule { id: id.to_string() })
            .await
    }

    async fn stop_rule(&self, id: &str) -> ControllerResult<()> {
        self.call_unit(IpcCommand::StopRule { id: id.to_string() })
            .await
    }

    async fn start_all_rules(&self) -> ControllerResult<()> {
        self.call_unit(IpcCommand::StartAllRules).await
    }

    async fn stop_all_rules(&self) -> ControllerResult<()> {
        self.call_unit(IpcCommand::StopAllRules).await
    }

    async fn get_chains(&self) -> ControllerResult<Vec<Chain>> {
        match self.client.send(IpcCommand::GetChains).await? {
            IpcResponse::Chains { chains } => Ok(chains),
            other => Err(unexpected("get_chains", &other).into()),
        }
    }

    async fn get_chain(&self, id: &str) -> ControllerResult<Chain> {
        let command = IpcCommand::GetChain { id: id.to_string() };
        match self.client.send(command).await? {
            IpcResponse::Chain { chain } => Ok(chain),
            other => Err(unexpected("get_chain", &other).into()),
        }
    }

    async fn create_chain(&self, chain: Chain) -> ControllerResult<Chain> {
        let id = self
            .call_created(IpcCommand::CreateChain(CreateChainArgs { chain }))
            .await?;
        self.get_chain(&id).await
    }

    async fn update_chain(&self, chain: Chain) -> ControllerResult<()> {
        self.call_unit(IpcCommand::UpdateChain(CreateChainArgs { chain }))
            .await
    }

    async fn delete_chain(&self, id: &str) -> ControllerResult<()> {
        self.call_unit(IpcCommand::DeleteChain { id: id.to_string() })
            .await
    }

    async fn get_config(&self) -> ControllerResult<AppConfig> {
        match self.client.send(IpcCommand::GetConfig).await? {
            IpcResponse::Config { config } => Ok(config),
            other => Err(unexpected("get_config", &other).into()),
        }
    }

    async fn update_config(&self, config: AppConfig) -> ControllerResult<()> {
        self.call_unit(IpcCommand::UpdateConfig { config }).await
    }

    async fn get_status(&self) -> ControllerResult<ServiceStatus> {
        match self.client.send(IpcCommand::GetStatus).await? {
            IpcResponse::Status { status } => Ok(status),
            other => Err(unexpected("get_status", &other).into()),
        }
    }

    async fn get_rule_stats(&self, rule_id: &str) -> ControllerResult<RuleStats> {
        let command = IpcCommand::GetRuleStats(RuleStatsArgs {
            rule_id: rule_id.to_string(),
        });
        match self.client.send(command).await? {
            IpcResponse::RuleStats { stats } => Ok(stats),
            other => Err(unexpected("get_rule_stats", &other).into()),
        }
    }

    async fn get_all_rule_stats(&self) -> ControllerResult<HashMap<String, RuleStats>> {
        match self.client.send(IpcCommand::GetAllRuleStats).await? {
            IpcResponse::AllRuleStats { stats } => Ok(stats),
            other => Err(unexpected("get_all_rule_stats", &other).into()),
        }
    }

    async fn reset_rule_stats(&self, rule_id: Option<&str>) -> ControllerResult<()> {
        self.call_unit(IpcCommand::ResetRuleStats {
            rule_id: rule_id.map(str::to_string),
        })
        .await
    }

    async fn get_logs(&self, count: usize) -> ControllerResult<Vec<LogEntry>> {
        self.call_logs(IpcCommand::GetLogs(GetLogsArgs { count }))
            .await
    }

    async fn get_logs_since(&self, since_id: u64) -> ControllerResult<Vec<LogEntry>> {
        self.call_logs(IpcCommand::GetLogsSince(GetLogsSinceArgs { since_id }))
            .await
    }

    async fn get_logs_by_rule(&self, rule_id: &str) -> ControllerResult<Vec<LogEntry>> {
        self.call_logs(IpcCommand::GetLogsByRule(GetLogsByRuleArgs {
            rule_id: rule_id.to_string(),
        }))
        .await
    }

    async fn clear_logs(&self) -> ControllerResult<()> {
        self.call_unit(IpcCommand::ClearLogs).await
    }

    async fn export_data(&self) -> ControllerResult<String> {
        match self.client.send(IpcCommand::ExportData).await? {
            IpcResponse::Data { data } => Ok(data),
            other => Err(unexpected("export_data", &other).into()),
        }
    }

    async fn import_data(&self, data: AppData, merge: bool) -> ControllerResult<()> {
        self.call_unit(IpcCommand::ImportData(ImportDataArgs { data, merge }))
            .await
    }

    /// Replace everything with an empty document carrying the current config
    async fn clear_all_data(&self) -> ControllerResult<()> {
        let config = self.get_config().await?;
        self.import_data(AppData::with_config(config), false).await
    }

    async fn shutdown(&self) -> ControllerResult<()> {
        self.client.disconnect().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{ErrorCode, IpcEndpoint};
    use std::time::Duration;

    #[tokio::test]
    async fn test_unreachable_daemon_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = IpcEndpoint::Tcp {
            ports: vec![1],
            port_files: vec![dir.path().join("missing.port")],
        };
        let remote = RemoteController::new(IpcClient::new(
            endpoint,
            Duration::from_millis(200),
            Duration::from_millis(500),
        ));

        let err = remote.get_status().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert_eq!(remote.mode(), ControllerMode::Remote);
    }
}
