//! IPC client/server integration tests
//!
//! A `LocalController` is served over each transport and driven through
//! `RemoteController`, so every call crosses the wire.

use std::sync::Arc;

use portwarden::controller::{RemoteController, ServiceController};
use portwarden::ipc::{read_port_file, ErrorCode, IpcCommand, IpcResponse, MAX_MESSAGE_SIZE};
use portwarden::model::{AppData, Chain, Hop, Protocol, RuleStatus};

use super::support::{
    client_for, echo_server, local_controller, tcp_endpoint, tcp_rule, RunningServer,
};

// ============================================================================
// TCP transport with port-file discovery
// ============================================================================

#[tokio::test]
async fn test_tcp_transport_rule_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(&dir.path().join("data"));
    let (endpoint, port_file) = tcp_endpoint(dir.path());

    let running = RunningServer::start(endpoint.clone(), local.clone(), MAX_MESSAGE_SIZE).await;
    let bound = running.server.bound_port().unwrap();
    assert_eq!(read_port_file(&port_file), Some(bound));

    // discovery goes through the port file only
    let discover = portwarden::ipc::IpcEndpoint::Tcp {
        ports: Vec::new(),
        port_files: vec![port_file.clone()],
    };
    let remote = RemoteController::new(client_for(discover));
    assert!(remote.client().ping().await.unwrap());

    let echo = echo_server().await;
    let rule = remote.create_rule(tcp_rule("web", echo)).await.unwrap();
    assert_eq!(remote.get_rules().await.unwrap().len(), 1);

    remote.start_rule(&rule.id).await.unwrap();
    assert!(local.engine().is_running(&rule.id));

    let status = remote.get_status().await.unwrap();
    assert!(status.running);
    assert_eq!(status.rules_active, 1);
    assert_eq!(status.rules_total, 1);

    let stored = remote.get_rule(&rule.id).await.unwrap();
    assert_eq!(stored.status, RuleStatus::Running);
    assert!(stored.enabled);

    remote.stop_rule(&rule.id).await.unwrap();
    assert!(!local.engine().is_running(&rule.id));

    running.stop().await;
    assert!(!port_file.exists());
}

#[tokio::test]
async fn test_business_errors_keep_code_and_message() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let (endpoint, _) = tcp_endpoint(dir.path());
    let running = RunningServer::start(endpoint.clone(), local, MAX_MESSAGE_SIZE).await;

    let remote = RemoteController::new(client_for(endpoint));

    let err = remote.get_rule("missing").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.to_string(), "rule not found");
    assert!(!err.is_transport());

    // a business failure leaves the connection usable
    assert!(remote.client().is_connected().await);
    assert!(remote.client().ping().await.unwrap());

    let mut chain = Chain::new("egress");
    chain.add_hop(Hop::new("127.0.0.1:1080", Protocol::Socks5));
    let chain = remote.create_chain(chain).await.unwrap();

    let mut rule = tcp_rule("via-chain", "127.0.0.1:9".parse().unwrap());
    rule.chain_id = Some(chain.id.clone());
    remote.create_rule(rule).await.unwrap();

    let err = remote.delete_chain(&chain.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InUse);
    assert_eq!(err.to_string(), "chain is in use by one or more rules");

    running.stop().await;
}

#[tokio::test]
async fn test_oversized_request_gets_error_reply() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let (endpoint, _) = tcp_endpoint(dir.path());
    let running = RunningServer::start(endpoint.clone(), local, 512).await;

    let client = client_for(endpoint);
    let mut rule = tcp_rule("big", "127.0.0.1:9".parse().unwrap());
    rule.description = "x".repeat(4096);

    let reply = client
        .call(&IpcCommand::CreateRule(portwarden::ipc::CreateRuleArgs { rule }))
        .await
        .unwrap();
    assert!(!reply.success);
    match reply.response {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidParameters),
        other => panic!("expected error, got {other:?}"),
    }

    // the same connection still answers
    assert!(client.is_connected().await);
    assert!(client.ping().await.unwrap());

    running.stop().await;
}

#[tokio::test]
async fn test_oversized_reply_becomes_error_reply() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    for name in ["a", "b", "c"] {
        let mut rule = tcp_rule(name, "127.0.0.1:9".parse().unwrap());
        rule.description = "x".repeat(1024);
        local.create_rule(rule).await.unwrap();
    }
    let (endpoint, _) = tcp_endpoint(dir.path());
    let running = RunningServer::start(endpoint.clone(), local, 2048).await;

    let client = client_for(endpoint);
    let reply = client.call(&IpcCommand::GetRules).await.unwrap();
    assert!(!reply.success);
    match reply.response {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::InternalError),
        other => panic!("expected error, got {other:?}"),
    }

    // no partial frame was written, so the connection stays in sync
    assert!(client.ping().await.unwrap());

    running.stop().await;
}

#[tokio::test]
async fn test_client_reconnects_after_server_restart() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let (endpoint, _) = tcp_endpoint(dir.path());

    let client = client_for(endpoint.clone());
    let running = RunningServer::start(endpoint.clone(), local.clone(), MAX_MESSAGE_SIZE).await;
    assert!(client.ping().await.unwrap());
    running.stop().await;

    // the held connection is dead; the failed call drops it
    let mut failed = false;
    for _ in 0..3 {
        if let Err(e) = client.ping().await {
            assert!(e.is_transport());
            failed = true;
            break;
        }
    }
    assert!(failed);
    assert!(!client.is_connected().await);

    let running = RunningServer::start(endpoint, local, MAX_MESSAGE_SIZE).await;
    assert!(client.ping().await.unwrap());
    running.stop().await;
}

// ============================================================================
// Bulk data over the wire
// ============================================================================

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let (endpoint, _) = tcp_endpoint(dir.path());
    let running = RunningServer::start(endpoint.clone(), local, MAX_MESSAGE_SIZE).await;
    let remote = RemoteController::new(client_for(endpoint));

    let mut chain = Chain::new("egress");
    chain.add_hop(Hop::new("127.0.0.1:1080", Protocol::Socks5));
    let chain = remote.create_chain(chain).await.unwrap();
    let mut rule = tcp_rule("a", "127.0.0.1:9".parse().unwrap());
    rule.chain_id = Some(chain.id.clone());
    let rule = remote.create_rule(rule).await.unwrap();

    let exported = remote.export_data().await.unwrap();
    remote.clear_all_data().await.unwrap();
    assert!(remote.get_rules().await.unwrap().is_empty());
    assert!(remote.get_chains().await.unwrap().is_empty());

    let data: AppData = serde_json::from_str(&exported).unwrap();
    remote.import_data(data, false).await.unwrap();

    let rules = remote.get_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].id, rule.id);
    assert_eq!(rules[0].chain_id.as_deref(), Some(chain.id.as_str()));
    assert_eq!(remote.get_chain(&chain.id).await.unwrap().hops.len(), 1);

    running.stop().await;
}

#[tokio::test]
async fn test_merge_import_upserts() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let (endpoint, _) = tcp_endpoint(dir.path());
    let running = RunningServer::start(endpoint.clone(), local, MAX_MESSAGE_SIZE).await;
    let remote = RemoteController::new(client_for(endpoint));

    let kept = remote
        .create_rule(tcp_rule("kept", "127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    let mut renamed = remote
        .create_rule(tcp_rule("old-name", "127.0.0.1:9".parse().unwrap()))
        .await
        .unwrap();
    renamed.name = "new-name".into();
    let added = tcp_rule("added", "127.0.0.1:9".parse().unwrap());

    let data = AppData {
        rules: vec![renamed.clone(), added.clone()],
        ..AppData::default()
    };
    remote.import_data(data, true).await.unwrap();

    let rules = remote.get_rules().await.unwrap();
    assert_eq!(rules.len(), 3);
    assert!(rules.iter().any(|r| r.id == kept.id));
    assert!(rules.iter().any(|r| r.id == added.id));
    assert_eq!(remote.get_rule(&renamed.id).await.unwrap().name, "new-name");

    running.stop().await;
}

// ============================================================================
// Unix socket transport
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_unix_transport_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(&dir.path().join("data"));
    let socket = dir.path().join("run").join("portwarden.sock");
    let endpoint = portwarden::ipc::IpcEndpoint::Unix {
        path: socket.clone(),
        mode: 0o666,
    };

    let running = RunningServer::start(endpoint.clone(), local, MAX_MESSAGE_SIZE).await;
    let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);

    let remote = RemoteController::new(client_for(endpoint));
    let echo = echo_server().await;
    let rule = remote.create_rule(tcp_rule("unix", echo)).await.unwrap();
    remote.start_rule(&rule.id).await.unwrap();
    assert_eq!(remote.get_status().await.unwrap().rules_active, 1);

    remote.stop_all_rules().await.unwrap();
    for rule in remote.get_rules().await.unwrap() {
        assert_eq!(rule.status, RuleStatus::Stopped);
    }

    let logs = remote.get_logs_by_rule(&rule.id).await.unwrap();
    assert!(!logs.is_empty());
    remote.clear_logs().await.unwrap();
    assert!(remote.get_logs(0).await.unwrap().is_empty());

    running.stop().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_handler_direct_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let local = local_controller(dir.path());
    let handler = portwarden::ipc::IpcHandler::new(Arc::clone(&local) as Arc<dyn ServiceController>);

    assert!(matches!(handler.handle(IpcCommand::Ping).await, IpcResponse::Pong));

    match handler
        .handle(IpcCommand::StartRule { id: "nope".into() })
        .await
    {
        IpcResponse::Error { code, message } => {
            assert_eq!(code, ErrorCode::NotFound);
            assert_eq!(message, "rule not found");
        }
        other => panic!("expected error, got {other:?}"),
    }

    // a stopping daemon refuses changes but still answers reads
    local.shutdown().await.unwrap();
    let rule = tcp_rule("late", "127.0.0.1:9".parse().unwrap());
    match handler
        .handle(IpcCommand::CreateRule(portwarden::ipc::CreateRuleArgs { rule }))
        .await
    {
        IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::ShuttingDown),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(matches!(
        handler.handle(IpcCommand::GetRules).await,
        IpcResponse::Rules { .. }
    ));
}
