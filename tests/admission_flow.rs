//! End-to-end admission through a running gatekeeper.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

#[tokio::test]
async fn whitelisted_client_is_never_limited() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, accepted) = common::start_echo_upstream().await;
    let rules = common::write_rules(
        dir.path(),
        r#"{"whitelist": ["127.0.0.1"], "allowed_ports": [80], "max_attempts_per_minute": 1, "max_attempts_per_hour": 1}"#,
    );

    let mut config = common::test_config(upstream, &rules);
    // The flood pre-check runs before the whitelist.
    config.flood.max_attempts_per_window = 1000;
    config.flood.max_connections_per_ip = 100;
    let running = common::start_gatekeeper(config).await;

    for i in 0..100 {
        assert!(
            common::round_trip(running.addr, "app.local").await,
            "connection {} was dropped",
            i + 1
        );
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 100);

    running.stop().await;
}

#[tokio::test]
async fn sixth_connection_in_a_minute_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, accepted) = common::start_echo_upstream().await;
    let rules = common::write_rules(
        dir.path(),
        r#"{"allowed_ports": [80], "max_attempts_per_minute": 5, "auto_block_enabled": false}"#,
    );
    let running = common::start_gatekeeper(common::test_config(upstream, &rules)).await;

    for i in 0..5 {
        assert!(
            common::round_trip(running.addr, "app.local:80").await,
            "connection {} should be proxied",
            i + 1
        );
    }
    assert!(!common::round_trip(running.addr, "app.local:80").await);
    assert_eq!(accepted.load(Ordering::SeqCst), 5);

    running.stop().await;
}

#[tokio::test]
async fn blocked_ip_and_disallowed_port_are_dropped_before_dialing() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, accepted) = common::start_echo_upstream().await;

    let rules = common::write_rules(dir.path(), r#"{"allowed_ports": [80]}"#);
    let running = common::start_gatekeeper(common::test_config(upstream, &rules)).await;
    assert!(!common::round_trip(running.addr, "app.local:8080").await);
    running.stop().await;

    let rules = common::write_rules(dir.path(), r#"{"blocked_ips": ["127.0.0.0/8"]}"#);
    let running = common::start_gatekeeper(common::test_config(upstream, &rules)).await;
    assert!(!common::round_trip(running.addr, "app.local").await);
    running.stop().await;

    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_rules_keep_previous_rules() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, _accepted) = common::start_echo_upstream().await;
    let rules = common::write_rules(dir.path(), r#"{"allowed_ports": [80]}"#);

    let mut config = common::test_config(upstream, &rules);
    config.flood.max_attempts_per_window = 1000;
    let running = common::start_gatekeeper(config).await;
    let before = running.admission.store().snapshot();

    std::fs::write(&rules, "{ this is not json").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = running.admission.store().snapshot();
    assert_eq!(after.version, before.version);
    assert_eq!(after.rules, before.rules);
    assert!(common::round_trip(running.addr, "app.local:80").await);
    assert!(!common::round_trip(running.addr, "app.local:8080").await);

    // A valid file is picked up again.
    std::fs::write(&rules, r#"{"allowed_ports": [80, 8080]}"#).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(common::round_trip(running.addr, "app.local:8080").await);

    running.stop().await;
}

#[tokio::test]
async fn silent_client_is_closed_without_dialing() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, accepted) = common::start_echo_upstream().await;
    let rules = common::write_rules(dir.path(), "{}");

    let mut config = common::test_config(upstream, &rules);
    config.timeouts.header_read = Duration::from_millis(200);
    let running = common::start_gatekeeper(config).await;

    let mut client = TcpStream::connect(running.addr).await.unwrap();
    assert!(common::closed_without_reply(&mut client, Duration::from_secs(2)).await);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);

    // The per-IP slot was released.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        running
            .admission
            .active_connections_for("127.0.0.1".parse().unwrap()),
        0
    );

    running.stop().await;
}

#[tokio::test]
async fn early_body_bytes_reach_upstream_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (upstream, _accepted) = common::start_echo_upstream().await;
    let rules = common::write_rules(dir.path(), "{}");
    let running = common::start_gatekeeper(common::test_config(upstream, &rules)).await;

    let request = b"POST /submit HTTP/1.1\r\nHost: app.local\r\nContent-Length: 9\r\n\r\nfirst-";
    let mut client = TcpStream::connect(running.addr).await.unwrap();
    client.write_all(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(b"end").await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(3),
        tokio::io::AsyncReadExt::read_to_end(&mut client, &mut echoed),
    )
    .await
    .unwrap()
    .unwrap();

    let mut expected = request.to_vec();
    expected.extend_from_slice(b"end");
    assert_eq!(echoed, expected);

    running.stop().await;
}
