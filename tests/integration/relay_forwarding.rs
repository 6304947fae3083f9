//! End-to-end forwarding through the local controller and relay backend

use portwarden::controller::ServiceController;
use portwarden::model::{Chain, Hop, Protocol, Rule, RuleType, Target};

use super::support::{echo_server, echo_through, eventually, free_port, local_controller, tcp_rule};

#[tokio::test]
async fn test_forward_rule_relays_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = local_controller(dir.path());
    let echo = echo_server().await;

    let rule = ctl.create_rule(tcp_rule("echo", echo)).await.unwrap();
    ctl.start_rule(&rule.id).await.unwrap();

    let listen = format!("127.0.0.1:{}", rule.local_port).parse().unwrap();
    assert_eq!(echo_through(listen, b"hello relay").await, b"hello relay");

    let engine = ctl.engine().clone();
    let id = rule.id.clone();
    assert!(
        eventually(|| {
            engine.collect_stats();
            let stats = engine.rule_stats(&id);
            stats.connections >= 1 && stats.total_bytes() > 0 && stats.active_conns == 0
        })
        .await
    );

    let all = ctl.get_all_rule_stats().await.unwrap();
    assert!(all.contains_key(&rule.id));

    ctl.reset_rule_stats(Some(&rule.id)).await.unwrap();
    assert_eq!(ctl.get_rule_stats(&rule.id).await.unwrap().connections, 0);

    let logs = ctl.get_logs_by_rule(&rule.id).await.unwrap();
    assert!(!logs.is_empty());
    let last = logs.last().unwrap().id;
    ctl.stop_rule(&rule.id).await.unwrap();
    assert!(!ctl.get_logs_since(last).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_weighted_targets_all_reachable() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = local_controller(dir.path());
    let a = echo_server().await;
    let b = echo_server().await;

    let mut rule = Rule::new("balanced", RuleType::Reverse);
    rule.local_port = free_port();
    rule.targets = vec![
        Target::new("127.0.0.1", a.port()),
        Target::new("127.0.0.1", b.port()),
    ];
    let rule = ctl.create_rule(rule).await.unwrap();
    ctl.start_rule(&rule.id).await.unwrap();

    let listen = format!("127.0.0.1:{}", rule.local_port).parse().unwrap();
    for i in 0..4u8 {
        let payload = [i; 8];
        assert_eq!(echo_through(listen, &payload).await, payload);
    }

    ctl.stop_rule(&rule.id).await.unwrap();
}

#[tokio::test]
async fn test_forward_through_socks5_chain() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = local_controller(dir.path());
    let echo = echo_server().await;

    // a SOCKS5 server rule acts as the chain's only hop
    let mut proxy = Rule::new("socks", RuleType::Chain);
    proxy.local_port = free_port();
    proxy.protocol = Protocol::Socks5;
    let proxy = ctl.create_rule(proxy).await.unwrap();
    ctl.start_rule(&proxy.id).await.unwrap();

    let mut chain = Chain::new("via-socks");
    chain.add_hop(Hop::new(format!("127.0.0.1:{}", proxy.local_port), Protocol::Socks5));
    let chain = ctl.create_chain(chain).await.unwrap();

    let mut rule = tcp_rule("chained", echo);
    rule.chain_id = Some(chain.id.clone());
    let rule = ctl.create_rule(rule).await.unwrap();
    ctl.start_rule(&rule.id).await.unwrap();

    let listen = format!("127.0.0.1:{}", rule.local_port).parse().unwrap();
    assert_eq!(echo_through(listen, b"through the chain").await, b"through the chain");

    let engine = ctl.engine().clone();
    let proxy_id = proxy.id.clone();
    assert!(
        eventually(|| {
            engine.collect_stats();
            engine.rule_stats(&proxy_id).connections >= 1
        })
        .await
    );

    ctl.stop_all_rules().await.unwrap();
}

#[tokio::test]
async fn test_unsupported_protocol_marks_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctl = local_controller(dir.path());

    let mut rule = tcp_rule("udp", "127.0.0.1:53".parse().unwrap());
    rule.protocol = Protocol::Udp;
    let rule = ctl.create_rule(rule).await.unwrap();

    let err = ctl.start_rule(&rule.id).await.unwrap_err();
    assert!(err.to_string().contains("not supported"));
    assert!(!ctl.engine().is_running(&rule.id));

    let stored = ctl.get_rule(&rule.id).await.unwrap();
    assert_eq!(stored.status, portwarden::model::RuleStatus::Error);
    assert_eq!(stored.error_msg, err.to_string());
}
