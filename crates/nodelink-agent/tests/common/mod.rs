//! Loopback gateway and targets for agent integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nodelink_agent::{Agent, AgentConfig, MemoryStore, StaticIdentity};
use nodelink_proto::{ControlMessage, TunnelFrame};
use nodelink_transport_websocket::frame::{encode_frame, read_frame, DEFAULT_MAX_PAYLOAD};
use nodelink_transport_websocket::{Frame, OpCode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("nodelink_agent=debug")
        .with_test_writer()
        .try_init();
}

/// Agent config tuned for tests: fast reconnects, no IP lookups
pub fn test_config(url: &str) -> AgentConfig {
    let mut config = AgentConfig::new(url);
    config.node_id = Some("node-test".to_string());
    config.ip_info.enabled = false;
    config.pool.size = Some(4);
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 200;
    config
}

pub fn test_agent(config: AgentConfig) -> Agent {
    Agent::new(
        config,
        Arc::new(StaticIdentity::new("device-test", "Test Device")),
        Arc::new(MemoryStore::new()),
    )
}

/// Poll `check` until it holds or `RECV_TIMEOUT` passes
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Minimal WebSocket gateway accepting agent connections
pub struct MockGateway {
    listener: TcpListener,
}

impl MockGateway {
    pub async fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/node", self.listener.local_addr().unwrap())
    }

    /// Accept the next agent connection and complete its upgrade
    pub async fn accept(&self) -> GatewaySession {
        let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("agent did not connect")
            .unwrap();

        let mut reader = BufReader::new(stream);
        let mut request = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            request.push(line);
        }

        let mut stream = reader.into_inner();
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: test\r\n\r\n",
            )
            .await
            .unwrap();

        GatewaySession { stream, request }
    }
}

/// Gateway side of one agent connection
pub struct GatewaySession {
    stream: TcpStream,
    pub request: Vec<String>,
}

impl GatewaySession {
    pub fn header(&self, name: &str) -> Option<&str> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.request.iter().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim())
        })
    }

    pub async fn send(&mut self, message: &ControlMessage) {
        let frame = Frame::text(message.to_json().unwrap());
        self.stream.write_all(&encode_frame(&frame, None)).await.unwrap();
    }

    pub async fn send_raw_text(&mut self, text: &str) {
        self.stream
            .write_all(&encode_frame(&Frame::text(text), None))
            .await
            .unwrap();
    }

    pub async fn send_tunnel_frame(&mut self, frame: &TunnelFrame) {
        let frame = Frame::binary(frame.encode().unwrap());
        self.stream.write_all(&encode_frame(&frame, None)).await.unwrap();
    }

    pub async fn recv_frame(&mut self) -> Frame {
        tokio::time::timeout(RECV_TIMEOUT, read_frame(&mut self.stream, DEFAULT_MAX_PAYLOAD))
            .await
            .expect("timed out waiting for agent frame")
            .unwrap()
    }

    /// Next control message, skipping keepalives
    pub async fn recv_message(&mut self) -> ControlMessage {
        loop {
            let frame = self.recv_frame().await;
            assert_eq!(frame.opcode, OpCode::Text, "expected a text frame");
            let message =
                ControlMessage::from_json(std::str::from_utf8(&frame.payload).unwrap()).unwrap();
            if !matches!(message, ControlMessage::Keepalive { .. }) {
                return message;
            }
        }
    }

    /// Next binary tunnel frame, skipping keepalives
    pub async fn recv_tunnel_frame(&mut self) -> TunnelFrame {
        loop {
            let frame = self.recv_frame().await;
            match frame.opcode {
                OpCode::Binary => return TunnelFrame::decode(frame.payload).unwrap(),
                OpCode::Text => continue,
                other => panic!("unexpected {:?} frame", other),
            }
        }
    }

    /// Read until the agent's close frame; returns its status code
    pub async fn recv_close(&mut self) -> Option<u16> {
        loop {
            let frame = self.recv_frame().await;
            if frame.opcode == OpCode::Close {
                return (frame.payload.len() >= 2)
                    .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
            }
        }
    }

    /// Next keepalive as `(uptime_sec, active_tunnels)`, skipping everything else
    pub async fn recv_keepalive(&mut self) -> (u64, usize) {
        loop {
            let frame = self.recv_frame().await;
            if frame.opcode != OpCode::Text {
                continue;
            }
            let message =
                ControlMessage::from_json(std::str::from_utf8(&frame.payload).unwrap()).unwrap();
            if let ControlMessage::Keepalive {
                uptime_sec,
                active_tunnels,
            } = message
            {
                return (uptime_sec, active_tunnels);
            }
        }
    }

    pub async fn expect_hello(&mut self) -> ControlMessage {
        let hello = self.recv_message().await;
        assert!(matches!(hello, ControlMessage::Hello { .. }), "got {:?}", hello);
        hello
    }
}

/// TCP target that answers one request with `response` and closes
pub async fn one_shot_target(response: &'static [u8]) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        socket.write_all(response).await.unwrap();
        socket.shutdown().await.unwrap();
        request
    });
    (port, task)
}

/// TCP target that accepts connections and holds them open
pub async fn idle_target() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

pub fn payload(bytes: &'static [u8]) -> Bytes {
    Bytes::from_static(bytes)
}
