//! Tunnel Manager - raw TCP bridges multiplexed over the control connection
//!
//! Each tunnel occupies one work-pool slot for its whole life. The slot owns
//! the target socket: it dials the target, then pumps bytes in both
//! directions until EOF, an error, or its cancellation token fires. The
//! control loop never touches a socket directly; it looks the tunnel up in
//! the registry and either queues gateway bytes on the tunnel's channel or
//! cancels it. Queueing never waits: a tunnel whose target stops draining is
//! closed instead of holding up the control connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use nodelink_proto::{
    validate_tunnel_id, ControlMessage, TunnelData, TunnelFrame, TunnelOpen, TunnelResponse,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DataEncoding, TunnelConfig};
use crate::outbound::Outbound;
use crate::pool::WorkPool;

/// Gateway -> target chunks buffered per tunnel
const TUNNEL_CHANNEL_CAPACITY: usize = 256;

/// Registry entry for one live (or connecting) tunnel
#[derive(Debug)]
pub struct TunnelHandle {
    tunnel_id: String,
    host: String,
    port: u16,
    data_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
    /// Set when inbound data overflowed the tunnel's buffer
    stalled: AtomicBool,
    opened_at: Instant,
}

impl TunnelHandle {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Signal the owning slot to tear down. Returns false if already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Active tunnel registry plus the recently-closed grace set
#[derive(Debug)]
pub struct TunnelManager {
    tunnels: DashMap<String, Arc<TunnelHandle>>,
    recently_closed: DashMap<String, Instant>,
    config: TunnelConfig,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            tunnels: DashMap::new(),
            recently_closed: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Number of tunnels open or being opened
    pub fn active_count(&self) -> usize {
        self.tunnels.len()
    }

    pub fn contains(&self, tunnel_id: &str) -> bool {
        self.tunnels.contains_key(tunnel_id)
    }

    pub fn get(&self, tunnel_id: &str) -> Option<Arc<TunnelHandle>> {
        self.tunnels.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Whether `tunnel_id` was closed within the grace window
    pub fn was_recently_closed(&self, tunnel_id: &str) -> bool {
        let grace = self.config.recently_closed_grace();
        let closed_at = match self.recently_closed.get(tunnel_id) {
            Some(entry) => *entry.value(),
            None => return false,
        };
        if closed_at.elapsed() <= grace {
            true
        } else {
            self.recently_closed.remove(tunnel_id);
            false
        }
    }

    /// Drop recently-closed entries older than the grace window
    pub fn prune_recently_closed(&self) {
        let grace = self.config.recently_closed_grace();
        self.recently_closed
            .retain(|_, closed_at| closed_at.elapsed() <= grace);
    }

    /// Deregister and close a tunnel. No-op (returns false) if it is not active.
    pub fn close(&self, tunnel_id: &str, reason: &str) -> bool {
        let Some((_, handle)) = self.tunnels.remove(tunnel_id) else {
            return false;
        };

        self.recently_closed
            .insert(tunnel_id.to_string(), Instant::now());
        self.prune_recently_closed();

        if handle.close() {
            info!(
                tunnel_id = %tunnel_id,
                target = %handle.target(),
                age_ms = handle.age().as_millis() as u64,
                reason,
                "Tunnel closed"
            );
        }
        true
    }

    /// Close every active tunnel; returns how many were closed
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        let count = ids.iter().filter(|id| self.close(id, reason)).count();
        if count > 0 {
            info!(count, reason, "Closed all tunnels");
        }
        count
    }

    fn register(&self, handle: Arc<TunnelHandle>) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.tunnels.entry(handle.tunnel_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.recently_closed.remove(&handle.tunnel_id);
                slot.insert(handle);
                true
            }
        }
    }

    /// Handle `tunnel_open`: validate, then dial and bridge on a pool slot.
    ///
    /// Every outcome (bad request, busy pool, dial failure, success) produces
    /// exactly one `tunnel_response`.
    pub async fn open(self: &Arc<Self>, request: TunnelOpen, pool: &WorkPool, outbound: &Outbound) {
        let tunnel_id = request.tunnel_id.clone();

        let port = match request.port.resolve() {
            Ok(port) => port,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, error = %e, "Rejecting tunnel_open");
                respond(outbound, TunnelResponse::failed(tunnel_id, e)).await;
                return;
            }
        };
        if let Err(e) = validate_tunnel_id(&tunnel_id) {
            warn!(tunnel_id = %tunnel_id, error = %e, "Rejecting tunnel_open");
            respond(outbound, TunnelResponse::failed(tunnel_id, e.to_string())).await;
            return;
        }
        if request.host.trim().is_empty() {
            respond(outbound, TunnelResponse::failed(tunnel_id, "missing host")).await;
            return;
        }
        if self.contains(&tunnel_id) {
            warn!(tunnel_id = %tunnel_id, "Duplicate tunnel_open for active tunnel");
            respond(
                outbound,
                TunnelResponse::failed(tunnel_id, "tunnel already active"),
            )
            .await;
            return;
        }

        let manager = Arc::clone(self);
        let slot_outbound = outbound.clone();
        let host = request.host.clone();

        let submitted = pool.try_spawn(move |token| async move {
            manager
                .run_tunnel(request.tunnel_id, host, port, slot_outbound, token)
                .await
        });

        if let Err(e) = submitted {
            warn!(tunnel_id = %tunnel_id, error = %e, "Tunnel rejected");
            respond(outbound, TunnelResponse::failed(tunnel_id, e.to_string())).await;
        }
    }

    /// Body of a tunnel's pool slot
    async fn run_tunnel(
        self: Arc<Self>,
        tunnel_id: String,
        host: String,
        port: u16,
        outbound: Outbound,
        slot_token: CancellationToken,
    ) {
        let (data_tx, data_rx) = mpsc::channel(TUNNEL_CHANNEL_CAPACITY);
        let handle = Arc::new(TunnelHandle {
            tunnel_id: tunnel_id.clone(),
            host: host.clone(),
            port,
            data_tx,
            cancel: slot_token.child_token(),
            closed: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            opened_at: Instant::now(),
        });

        if !self.register(handle.clone()) {
            respond(
                &outbound,
                TunnelResponse::failed(tunnel_id, "tunnel already active"),
            )
            .await;
            return;
        }

        let _deregister = Deregister {
            manager: Arc::clone(&self),
            tunnel_id: tunnel_id.clone(),
        };

        debug!(tunnel_id = %tunnel_id, target = %handle.target(), "Connecting to tunnel target");

        let dial = timeout(
            self.config.connect_timeout(),
            TcpStream::connect((host.as_str(), port)),
        );
        let stream = tokio::select! {
            _ = handle.cancel.cancelled() => {
                respond(&outbound, TunnelResponse::failed(tunnel_id, "tunnel closed while connecting")).await;
                return;
            }
            result = dial => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    self.close(&tunnel_id, "connect failed");
                    warn!(tunnel_id = %tunnel_id, target = %handle.target(), error = %e, "Tunnel connect failed");
                    respond(&outbound, TunnelResponse::failed(tunnel_id, e.to_string())).await;
                    return;
                }
                Err(_) => {
                    self.close(&tunnel_id, "connect timeout");
                    warn!(tunnel_id = %tunnel_id, target = %handle.target(), "Tunnel connect timed out");
                    respond(
                        &outbound,
                        TunnelResponse::failed(
                            tunnel_id,
                            format!("connect timeout after {}ms", self.config.connect_timeout_ms),
                        ),
                    )
                    .await;
                    return;
                }
            }
        };

        if let Err(e) = configure_target_socket(&stream) {
            debug!(tunnel_id = %tunnel_id, error = %e, "Failed to set target socket options");
        }

        let ack = ControlMessage::TunnelResponse {
            data: TunnelResponse::ok(tunnel_id.clone()),
        };
        if let Err(e) = outbound.send_message(&ack).await {
            debug!(tunnel_id = %tunnel_id, error = %e, "Could not acknowledge tunnel");
            self.close(&tunnel_id, "control connection lost");
            return;
        }

        info!(tunnel_id = %tunnel_id, target = %handle.target(), "Tunnel opened");

        let (reader, writer) = stream.into_split();
        let encoding = self.config.data_encoding;

        let reason = tokio::select! {
            _ = handle.cancel.cancelled() => {
                if handle.stalled.load(Ordering::SeqCst) {
                    send_eof(&outbound, encoding, &tunnel_id).await;
                    "target stalled"
                } else {
                    "closed"
                }
            }
            reason = pump_to_gateway(
                reader,
                &tunnel_id,
                &outbound,
                encoding,
                self.config.read_buffer_size,
                self.config.read_idle_timeout(),
            ) => reason,
            reason = pump_to_target(writer, data_rx, &tunnel_id, &outbound, encoding) => reason,
        };

        self.close(&tunnel_id, reason);
    }

    /// Gateway -> target data (binary frame or decoded JSON `tunnel_data`).
    /// Never waits on the target.
    pub fn handle_data(&self, frame: TunnelFrame) {
        let Some(handle) = self.get(&frame.tunnel_id) else {
            if self.was_recently_closed(&frame.tunnel_id) {
                trace!(tunnel_id = %frame.tunnel_id, "Dropping data for recently closed tunnel");
            } else {
                warn!(
                    tunnel_id = %frame.tunnel_id,
                    len = frame.payload.len(),
                    "Data for unknown tunnel"
                );
            }
            return;
        };

        if frame.eof {
            self.close(&frame.tunnel_id, "gateway eof");
            return;
        }
        if frame.payload.is_empty() {
            return;
        }

        match handle.data_tx.try_send(frame.payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    tunnel_id = %frame.tunnel_id,
                    buffered = TUNNEL_CHANNEL_CAPACITY,
                    "Tunnel target not draining, closing"
                );
                handle.stalled.store(true, Ordering::SeqCst);
                self.close(&frame.tunnel_id, "target stalled");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(tunnel_id = %frame.tunnel_id, "Tunnel writer already gone");
            }
        }
    }

    /// Legacy JSON `tunnel_data` from the gateway
    pub fn handle_json_data(&self, data: TunnelData) {
        let payload = match data.decode_payload() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!(tunnel_id = %data.tunnel_id, error = %e, "Invalid tunnel_data payload");
                return;
            }
        };
        self.handle_data(TunnelFrame {
            tunnel_id: data.tunnel_id,
            eof: data.eof,
            payload,
        });
    }

    /// `tunnel_close` from the gateway
    pub fn handle_close(&self, tunnel_id: &str) {
        if !self.close(tunnel_id, "gateway close") {
            trace!(tunnel_id = %tunnel_id, "tunnel_close for inactive tunnel");
        }
    }
}

/// Deregisters the tunnel however its slot ends, including being dropped on pool shutdown
struct Deregister {
    manager: Arc<TunnelManager>,
    tunnel_id: String,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        self.manager.close(&self.tunnel_id, "slot ended");
    }
}

fn configure_target_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    socket2::SockRef::from(stream).set_keepalive(true)
}

async fn respond(outbound: &Outbound, response: TunnelResponse) {
    let tunnel_id = response.tunnel_id.clone();
    let message = ControlMessage::TunnelResponse { data: response };
    if let Err(e) = outbound.send_message(&message).await {
        debug!(tunnel_id = %tunnel_id, error = %e, "Failed to send tunnel_response");
    }
}

/// Target -> gateway. A read timeout is an idle poll, not a failure.
async fn pump_to_gateway(
    mut reader: OwnedReadHalf,
    tunnel_id: &str,
    outbound: &Outbound,
    encoding: DataEncoding,
    buffer_size: usize,
    idle_timeout: Duration,
) -> &'static str {
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        match timeout(idle_timeout, reader.read(&mut buf)).await {
            Err(_) => {
                trace!(tunnel_id = %tunnel_id, "Tunnel target idle");
            }
            Ok(Ok(0)) => {
                debug!(tunnel_id = %tunnel_id, "Tunnel target closed");
                send_eof(outbound, encoding, tunnel_id).await;
                return "target eof";
            }
            Ok(Ok(n)) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if let Err(e) = outbound.send_tunnel_data(encoding, tunnel_id, chunk).await {
                    debug!(tunnel_id = %tunnel_id, error = %e, "Failed to forward tunnel data");
                    return "control connection lost";
                }
                trace!(tunnel_id = %tunnel_id, bytes = n, "Forwarded target data");
            }
            Ok(Err(e)) => {
                debug!(tunnel_id = %tunnel_id, error = %e, "Tunnel target read error");
                send_eof(outbound, encoding, tunnel_id).await;
                return "target read error";
            }
        }
    }
}

/// Gateway -> target, in arrival order
async fn pump_to_target(
    mut writer: OwnedWriteHalf,
    mut data_rx: mpsc::Receiver<Bytes>,
    tunnel_id: &str,
    outbound: &Outbound,
    encoding: DataEncoding,
) -> &'static str {
    while let Some(chunk) = data_rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!(tunnel_id = %tunnel_id, error = %e, "Tunnel target write error");
            send_eof(outbound, encoding, tunnel_id).await;
            return "target write error";
        }
        trace!(tunnel_id = %tunnel_id, bytes = chunk.len(), "Wrote gateway data to target");
    }
    "tunnel channel closed"
}

async fn send_eof(outbound: &Outbound, encoding: DataEncoding, tunnel_id: &str) {
    if let Err(e) = outbound.send_tunnel_eof(encoding, tunnel_id).await {
        debug!(tunnel_id = %tunnel_id, error = %e, "Failed to send tunnel EOF");
    }
}
