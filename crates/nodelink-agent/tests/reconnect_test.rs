/// Connection supervisor tests: reconnects, gateway cooldown, stop, and the
/// per-connection IP report
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::*;
use nodelink_agent::{AgentError, AgentState, IpLookup};
use nodelink_proto::ControlMessage;

#[tokio::test]
async fn test_reconnects_after_gateway_drop() {
    init_tracing();
    let gateway = MockGateway::bind().await;
    let agent = test_agent(test_config(&gateway.url()));
    agent.start().await.unwrap();

    let mut first = gateway.accept().await;
    first.expect_hello().await;
    assert!(wait_until(|| agent.is_connected()).await);
    drop(first);

    let mut second = gateway.accept().await;
    second.expect_hello().await;

    assert!(
        wait_until(|| {
            let stats = agent.stats();
            stats.total_connections == 2 && stats.state == AgentState::Connected
        })
        .await
    );
    let stats = agent.stats();
    assert_eq!(stats.total_disconnections, 1);
    assert_eq!(stats.reconnect_attempt, 0);
    assert!(stats.connected_since.is_some());

    agent.stop().await;
}

#[tokio::test]
async fn test_keepalive_uptime_restarts_per_connection() {
    init_tracing();
    let gateway = MockGateway::bind().await;
    let mut config = test_config(&gateway.url());
    config.keepalive_interval_ms = 300;
    let agent = test_agent(config);
    agent.start().await.unwrap();

    let mut first = gateway.accept().await;
    first.expect_hello().await;
    loop {
        let (uptime_sec, active_tunnels) = first.recv_keepalive().await;
        assert_eq!(active_tunnels, 0);
        if uptime_sec >= 1 {
            break;
        }
    }
    drop(first);

    let mut second = gateway.accept().await;
    second.expect_hello().await;
    let (uptime_sec, _) = second.recv_keepalive().await;
    assert_eq!(uptime_sec, 0, "uptime carried over from the previous connection");

    agent.stop().await;
}

#[tokio::test]
async fn test_failed_connects_back_off() {
    init_tracing();
    // Reserve a port, then free it so the first attempts are refused
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let agent = test_agent(test_config(&format!("ws://{}/node", addr)));
    agent.start().await.unwrap();

    assert!(wait_until(|| agent.stats().reconnect_attempt >= 2).await);
    assert_eq!(agent.stats().total_connections, 0);
    assert!(agent.is_running().await);

    agent.stop().await;
    assert_eq!(agent.state(), AgentState::Stopped);
}

#[tokio::test]
async fn test_cooldown_overrides_backoff() {
    init_tracing();
    let gateway = MockGateway::bind().await;
    let agent = test_agent(test_config(&gateway.url()));
    agent.start().await.unwrap();

    let mut session = gateway.accept().await;
    session.expect_hello().await;

    let mut states = agent.subscribe();
    session
        .send(&ControlMessage::Cooldown {
            retry_after_sec: Some(1),
        })
        .await;
    let sent_at = Instant::now();

    assert_eq!(session.recv_close().await, Some(1000));
    tokio::time::timeout(RECV_TIMEOUT, states.wait_for(|s| *s == AgentState::Cooldown))
        .await
        .expect("agent never entered cooldown")
        .unwrap();
    assert_eq!(agent.stats().reconnect_attempt, 1);

    let mut next = gateway.accept().await;
    let waited = sent_at.elapsed();
    next.expect_hello().await;

    // Backoff alone would have retried after ~20ms
    assert!(waited >= Duration::from_secs(1), "reconnected after {:?}", waited);

    agent.stop().await;
}

#[tokio::test]
async fn test_unparseable_messages_are_ignored() {
    init_tracing();
    let gateway = MockGateway::bind().await;
    let agent = test_agent(test_config(&gateway.url()));
    agent.start().await.unwrap();

    let mut session = gateway.accept().await;
    session.expect_hello().await;

    session.send_raw_text("this is not json").await;
    session.send_raw_text(r#"{"type":"firmware_update","data":{}}"#).await;
    session.send(&ControlMessage::Welcome).await;
    session.send(&ControlMessage::KeepaliveAck).await;
    session
        .send_raw_text(r#"{"type":"proxy_request","data":{"request_id":"probe"}}"#)
        .await;

    match session.recv_message().await {
        ControlMessage::ProxyResponse { data } => {
            assert_eq!(data.request_id, "probe");
            assert!(!data.success);
        }
        other => panic!("expected proxy_response, got {:?}", other),
    }
    assert_eq!(agent.stats().total_connections, 1);
    assert_eq!(agent.stats().total_disconnections, 0);

    agent.stop().await;
}

#[tokio::test]
async fn test_stop_is_prompt_and_restartable() {
    init_tracing();
    let port = idle_target().await;
    let gateway = MockGateway::bind().await;
    let agent = test_agent(test_config(&gateway.url()));
    agent.start().await.unwrap();
    assert!(matches!(agent.start().await, Err(AgentError::AlreadyRunning)));

    let mut session = gateway.accept().await;
    session.expect_hello().await;
    session
        .send_raw_text(&format!(
            r#"{{"type":"tunnel_open","data":{{"tunnel_id":"held","host":"127.0.0.1","port":{}}}}}"#,
            port
        ))
        .await;
    match session.recv_message().await {
        ControlMessage::TunnelResponse { data } => assert!(data.success),
        other => panic!("expected tunnel_response, got {:?}", other),
    }
    assert_eq!(agent.active_tunnel_count(), 1);

    let started = Instant::now();
    agent.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(agent.state(), AgentState::Stopped);
    assert_eq!(agent.active_tunnel_count(), 0);
    assert!(!agent.is_running().await);
    assert_eq!(session.recv_close().await, Some(1000));

    // Stopping twice is harmless; starting again reconnects
    agent.stop().await;
    agent.start().await.unwrap();
    let mut again = gateway.accept().await;
    again.expect_hello().await;
    agent.stop().await;
}

const GEO_PAGE: &str = r#"<pre><code class="language-json">{&quot;ip&quot;:&quot;203.0.113.7&quot;,&quot;country_name&quot;:&quot;Netherlands&quot;}</code></pre>"#;

struct FixedLookup {
    ip_calls: AtomicUsize,
}

#[async_trait]
impl IpLookup for FixedLookup {
    async fn public_ip(&self) -> Result<String, AgentError> {
        self.ip_calls.fetch_add(1, Ordering::SeqCst);
        Ok("203.0.113.7".to_string())
    }

    async fn details_page(&self, _ip: &str) -> Result<String, AgentError> {
        Ok(GEO_PAGE.to_string())
    }
}

#[tokio::test]
async fn test_ip_info_reported_once_per_window() {
    init_tracing();
    let gateway = MockGateway::bind().await;
    let mut config = test_config(&gateway.url());
    config.ip_info.enabled = true;
    let lookup = Arc::new(FixedLookup {
        ip_calls: AtomicUsize::new(0),
    });
    let agent = test_agent(config).with_ip_lookup(lookup.clone());
    agent.start().await.unwrap();

    let mut session = gateway.accept().await;
    session.expect_hello().await;
    match session.recv_message().await {
        ControlMessage::IpInfo(report) => {
            assert_eq!(report.node_id, "node-test");
            assert_eq!(report.device_id, "device-test");
            assert_eq!(report.ip, "203.0.113.7");
            assert_eq!(report.ip_info["country_name"], "Netherlands");
        }
        other => panic!("expected ip_info, got {:?}", other),
    }
    drop(session);

    // Reconnect inside the refresh window: cached report, no new lookup
    let mut session = gateway.accept().await;
    session.expect_hello().await;
    match session.recv_message().await {
        ControlMessage::IpInfo(report) => {
            assert_eq!(report.ip, "203.0.113.7");
            assert_eq!(report.ip_fetch_ms, None);
        }
        other => panic!("expected ip_info, got {:?}", other),
    }
    assert_eq!(lookup.ip_calls.load(Ordering::SeqCst), 1);

    agent.stop().await;
}
