//! Startup controller selection
//!
//! `connect_or_embed` binds to a daemon that answers `GetStatus`, and embeds
//! an engine otherwise.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use portwarden::config::Settings;
use portwarden::controller::{connect_or_embed, ControllerMode};
use portwarden::model::RuleStatus;
use portwarden::Daemon;

use super::support::{echo_server, isolated_settings, tcp_rule};

#[tokio::test]
async fn test_embeds_when_no_daemon_answers() {
    let dir = tempfile::tempdir().unwrap();
    let settings = isolated_settings(dir.path());

    let handle = connect_or_embed(&settings).await.unwrap();
    assert_eq!(handle.mode, ControllerMode::Local);
    assert_eq!(handle.controller.mode(), ControllerMode::Local);
    assert!(handle.init_report.is_some());

    handle.controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_embedded_engine_starts_enabled_rules() {
    let dir = tempfile::tempdir().unwrap();
    let settings = isolated_settings(dir.path());
    let echo = echo_server().await;

    // persist an enabled rule through a first embedded controller
    let first = connect_or_embed(&settings).await.unwrap();
    let mut rule = tcp_rule("persisted", echo);
    rule.enabled = true;
    let rule = first.controller.create_rule(rule).await.unwrap();
    first.controller.shutdown().await.unwrap();
    drop(first);

    let second = connect_or_embed(&settings).await.unwrap();
    let report = second.init_report.clone().unwrap();
    assert_eq!(report.started, vec![rule.id.clone()]);
    assert_eq!(
        second.controller.get_rule(&rule.id).await.unwrap().status,
        RuleStatus::Running
    );

    second.controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_binds_to_running_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let settings = isolated_settings(dir.path());

    let daemon = std::sync::Arc::new(Daemon::new(&settings).unwrap());
    let token = CancellationToken::new();
    let runner = {
        let daemon = std::sync::Arc::clone(&daemon);
        let token = token.clone();
        tokio::spawn(async move { daemon.run(token).await })
    };

    let mut handle = None;
    for _ in 0..50 {
        let candidate = connect_or_embed(&client_settings(&settings)).await.unwrap();
        if candidate.mode == ControllerMode::Remote {
            handle = Some(candidate);
            break;
        }
        candidate.controller.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let handle = handle.expect("daemon never answered");
    assert!(handle.init_report.is_none());

    // a rule created remotely lands in the daemon's engine
    let echo = echo_server().await;
    let rule = handle
        .controller
        .create_rule(tcp_rule("remote", echo))
        .await
        .unwrap();
    handle.controller.start_rule(&rule.id).await.unwrap();
    assert!(daemon.controller().engine().is_running(&rule.id));

    token.cancel();
    runner.await.unwrap();
    assert_eq!(daemon.controller().engine().running_count(), 0);
}

/// Same endpoint, separate data dir, so a local fallback never shares the
/// daemon's store
fn client_settings(daemon: &Settings) -> Settings {
    let mut settings = daemon.clone();
    if let Some(dir) = &daemon.data_dir {
        settings.data_dir = Some(dir.with_extension("client"));
    }
    settings
}
