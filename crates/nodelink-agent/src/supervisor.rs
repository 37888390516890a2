//! Connection supervisor
//!
//! Owns the control connection for the life of a started agent: connect,
//! greet, run the read loop, and on any failure tear the session down and
//! wait (backoff or gateway cooldown) before trying again. Stop interrupts
//! every wait and read via the cancellation token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nodelink_proto::{ControlMessage, TunnelFrame, SDK_VERSION};
use nodelink_transport_websocket::{
    Message, TransportError, WebSocketConfig, WebSocketConnection, WebSocketReader,
};
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::agent::{AgentError, AgentShared, AgentState};
use crate::config::AgentConfig;
use crate::ip_info::IpInfoReporter;
use crate::outbound::Outbound;
use crate::pool::WorkPool;
use crate::proxy::ProxyExecutor;
use crate::reconnect::{ReconnectManager, Wait};
use crate::tunnel::TunnelManager;

/// Normal closure status sent on disconnect
const CLOSE_NORMAL: u16 = 1000;

/// How long queued frames get to flush when a session ends
const WRITER_FLUSH_GRACE: Duration = Duration::from_secs(2);

/// How long in-flight pool jobs get to exit on stop
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Why a session ended
#[derive(Debug)]
enum SessionEnd {
    Stopped,
    Disconnected(String),
}

pub(crate) struct Supervisor {
    config: Arc<AgentConfig>,
    node_id: String,
    device_model: String,
    shared: Arc<AgentShared>,
    tunnels: Arc<TunnelManager>,
    proxy: Arc<ProxyExecutor>,
    pool: WorkPool,
    reconnect: ReconnectManager,
    ip_reporter: Option<Arc<IpInfoReporter>>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<AgentConfig>,
        node_id: String,
        device_model: String,
        shared: Arc<AgentShared>,
        tunnels: Arc<TunnelManager>,
        proxy: Arc<ProxyExecutor>,
        pool: WorkPool,
        ip_reporter: Option<Arc<IpInfoReporter>>,
    ) -> Self {
        let reconnect = ReconnectManager::new(config.reconnect.clone());
        Self {
            config,
            node_id,
            device_model,
            shared,
            tunnels,
            proxy,
            pool,
            reconnect,
            ip_reporter,
        }
    }

    /// Connect/reconnect until `cancel` fires
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        info!(pool_size = self.pool.size(), "Connection supervisor started");

        while !cancel.is_cancelled() {
            self.shared.set_state(AgentState::Connecting);

            let reason = match self.run_session(&cancel).await {
                SessionEnd::Stopped => break,
                SessionEnd::Disconnected(reason) => reason,
            };

            let closed = self.tunnels.close_all("control connection lost");
            let attempt = self.reconnect.record_disconnect();
            self.shared.set_reconnect_attempt(attempt);

            info!(
                reason = %reason,
                attempt,
                closed_tunnels = closed,
                "Disconnected from gateway"
            );

            let state = match self.reconnect.pending_cooldown() {
                Some(_) => AgentState::Cooldown,
                None => AgentState::Backoff,
            };
            self.shared.set_state(state);

            match self.reconnect.wait(&cancel).await {
                Ok(Wait::Cooldown(d)) => {
                    info!(waited_ms = d.as_millis() as u64, "Cooldown elapsed, reconnecting")
                }
                Ok(Wait::Backoff(d)) => {
                    debug!(waited_ms = d.as_millis() as u64, attempt, "Backoff elapsed, reconnecting")
                }
                Err(_) => break,
            }
        }

        let closed = self.tunnels.close_all("agent stopped");
        self.pool.shutdown(POOL_SHUTDOWN_GRACE).await;
        self.shared.set_state(AgentState::Stopped);
        info!(closed_tunnels = closed, "Connection supervisor stopped");
    }

    fn websocket_config(&self) -> Result<WebSocketConfig, AgentError> {
        let mut ws = WebSocketConfig::new(&self.config.server_url)?
            .with_connect_timeout(self.config.connect_timeout())
            .with_read_timeout(self.config.read_timeout())
            .with_header("User-Agent", format!("nodelink/{}", SDK_VERSION))
            .with_header("X-Node-Id", self.node_id.clone());
        for (name, value) in &self.config.headers {
            ws = ws.with_header(name.clone(), value.clone());
        }
        if self.config.insecure_skip_verify {
            ws = ws.with_insecure_skip_verify();
        }
        Ok(ws)
    }

    /// One connection from dial to teardown
    async fn run_session(&mut self, cancel: &CancellationToken) -> SessionEnd {
        let ws_config = match self.websocket_config() {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Invalid gateway configuration");
                return SessionEnd::Disconnected(e.to_string());
            }
        };

        debug!(server = %ws_config.url, attempt = self.reconnect.attempt(), "Connecting to gateway");

        let connection = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Stopped,
            result = WebSocketConnection::connect(&ws_config) => match result {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(server = %ws_config.url, error = %e, "Failed to connect to gateway");
                    return SessionEnd::Disconnected(format!("connect failed: {}", e));
                }
            },
        };

        let (sender, mut reader, writer) = connection.into_parts();
        let outbound = Outbound::new(sender);

        let hello = ControlMessage::Hello {
            node_id: self.node_id.clone(),
            device_model: self.device_model.clone(),
            sdk_version: SDK_VERSION.to_string(),
        };
        if let Err(e) = outbound.send_message(&hello).await {
            warn!(error = %e, "Failed to send hello");
            writer.shutdown(WRITER_FLUSH_GRACE).await;
            return SessionEnd::Disconnected(format!("hello failed: {}", e));
        }

        self.reconnect.reset();
        self.shared.on_connected();
        let connected_at = Instant::now();
        info!(
            node_id = %self.node_id,
            connection_id = %reader.connection_id(),
            "Connected to gateway"
        );

        let session = cancel.child_token();
        tokio::spawn(keepalive_loop(
            outbound.clone(),
            Arc::clone(&self.tunnels),
            self.config.keepalive_interval(),
            connected_at,
            session.clone(),
        ));
        if let Some(reporter) = &self.ip_reporter {
            tokio::spawn(report_ip_info(
                Arc::clone(reporter),
                outbound.clone(),
                session.clone(),
            ));
        }

        let end = self.read_loop(&mut reader, &outbound, cancel).await;

        session.cancel();
        if !outbound.is_closed() {
            match timeout(WRITER_FLUSH_GRACE, outbound.close(CLOSE_NORMAL, "normal closure")).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Close frame not sent"),
                Err(_) => debug!("Timed out queueing close frame"),
            }
        }
        writer.shutdown(WRITER_FLUSH_GRACE).await;
        self.shared.on_disconnected();

        end
    }

    async fn read_loop(
        &mut self,
        reader: &mut WebSocketReader,
        outbound: &Outbound,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return SessionEnd::Stopped,
                message = reader.recv() => message,
            };

            match message {
                Ok(Message::Text(text)) => {
                    if let Some(end) = self.dispatch(&text, outbound).await {
                        return end;
                    }
                }
                Ok(Message::Binary(payload)) => match TunnelFrame::decode(payload) {
                    Ok(frame) => self.tunnels.handle_data(frame),
                    Err(e) => warn!(error = %e, "Dropping malformed tunnel frame"),
                },
                Ok(Message::Close(frame)) => {
                    return SessionEnd::Disconnected(format!("closed by gateway ({})", frame));
                }
                Err(TransportError::Timeout) => {
                    return SessionEnd::Disconnected("read timeout".to_string());
                }
                Err(e) => return SessionEnd::Disconnected(e.to_string()),
            }
        }
    }

    /// Handle one JSON control message; `Some` ends the session
    async fn dispatch(&mut self, text: &str, outbound: &Outbound) -> Option<SessionEnd> {
        let message = match ControlMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, len = text.len(), "Dropping unparseable control message");
                return None;
            }
        };

        trace!(message_type = message.type_name(), "Received message");

        match message {
            ControlMessage::TunnelOpen { data } => {
                debug!(tunnel_id = %data.tunnel_id, host = %data.host, "tunnel_open");
                self.tunnels.open(data, &self.pool, outbound).await;
            }
            ControlMessage::TunnelData { data } => {
                self.tunnels.handle_json_data(data);
            }
            ControlMessage::TunnelClose { data } => {
                self.tunnels.handle_close(&data.tunnel_id);
            }
            ControlMessage::ProxyRequest { data } => {
                debug!(request_id = %data.request_id, "proxy_request");
                self.proxy.submit(data, &self.pool, outbound).await;
            }
            ControlMessage::Cooldown { retry_after_sec } => {
                let duration = self.reconnect.set_cooldown(retry_after_sec);
                warn!(
                    retry_after_ms = duration.as_millis() as u64,
                    "Gateway requested cooldown, disconnecting"
                );
                return Some(SessionEnd::Disconnected("cooldown requested".to_string()));
            }
            ControlMessage::Welcome => debug!("Gateway welcome"),
            ControlMessage::KeepaliveAck => trace!("Keepalive acknowledged"),
            ControlMessage::Unknown => debug!(len = text.len(), "Ignoring unrecognized message"),
            other => {
                debug!(message_type = other.type_name(), "Ignoring agent-bound message type");
            }
        }

        None
    }
}

/// Periodic keepalive for one session; uptime counts from `connected_at`
async fn keepalive_loop(
    outbound: Outbound,
    tunnels: Arc<TunnelManager>,
    period: Duration,
    connected_at: Instant,
    session: CancellationToken,
) {
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                let message = ControlMessage::Keepalive {
                    uptime_sec: connected_at.elapsed().as_secs(),
                    active_tunnels: tunnels.active_count(),
                };
                if let Err(e) = outbound.send_message(&message).await {
                    debug!(error = %e, "Keepalive failed, stopping keepalive loop");
                    break;
                }
                trace!("Keepalive sent");
            }
        }
    }
}

/// Best-effort `ip_info` for one session
async fn report_ip_info(
    reporter: Arc<IpInfoReporter>,
    outbound: Outbound,
    session: CancellationToken,
) {
    let report = tokio::select! {
        _ = session.cancelled() => return,
        report = reporter.report() => report,
    };

    match report {
        Ok(Some(report)) => {
            if let Err(e) = outbound.send_message(&ControlMessage::IpInfo(report)).await {
                debug!(error = %e, "Failed to send ip_info");
            }
        }
        Ok(None) => debug!("No IP info to report"),
        Err(e) => warn!(error = %e, "IP info lookup failed"),
    }
}
