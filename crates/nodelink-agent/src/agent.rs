//! Public service object
//!
//! [`Agent`] is what a host application holds: build it once with a config,
//! an identity provider and a key/value cache, then `start` and `stop` it.
//! All connection work happens on a spawned supervisor task; the accessors
//! here only read shared counters.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nodelink_proto::{MessageError, TunnelFrameError};
use nodelink_transport_websocket::{TransportError, WebSocketConfig};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::identity::DeviceIdentity;
use crate::ip_info::{HttpIpLookup, IpInfoReporter, IpLookup};
use crate::pool::{PoolError, WorkPool};
use crate::proxy::ProxyExecutor;
use crate::store::KeyValueStore;
use crate::supervisor::Supervisor;
use crate::tunnel::TunnelManager;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Tunnel frame error: {0}")]
    TunnelFrame(#[from] TunnelFrameError),

    #[error("Work pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Agent is already running")]
    AlreadyRunning,

    #[error("Store error: {0}")]
    Store(String),

    #[error("IP lookup failed: {0}")]
    IpLookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Backoff,
    Cooldown,
    Stopped,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Connecting => "connecting",
            AgentState::Connected => "connected",
            AgentState::Disconnected => "disconnected",
            AgentState::Backoff => "backoff",
            AgentState::Cooldown => "cooldown",
            AgentState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time lifecycle counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStats {
    pub state: AgentState,
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub reconnect_attempt: u32,
    pub connected_since: Option<SystemTime>,
    pub active_tunnels: usize,
}

impl AgentStats {
    /// Time since the current connection was established
    pub fn connection_uptime(&self) -> Option<Duration> {
        self.connected_since
            .and_then(|since| SystemTime::now().duration_since(since).ok())
    }
}

/// State shared between the service object and its supervisor task
#[derive(Debug)]
pub(crate) struct AgentShared {
    state_tx: watch::Sender<AgentState>,
    total_connections: AtomicU64,
    total_disconnections: AtomicU64,
    reconnect_attempt: AtomicU32,
    /// Epoch millis of the current connection, 0 while disconnected
    connected_since_ms: AtomicU64,
}

impl AgentShared {
    fn new() -> Self {
        let (state_tx, _) = watch::channel(AgentState::Idle);
        Self {
            state_tx,
            total_connections: AtomicU64::new(0),
            total_disconnections: AtomicU64::new(0),
            reconnect_attempt: AtomicU32::new(0),
            connected_since_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Agent state changed");
        }
    }

    pub(crate) fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    pub(crate) fn on_connected(&self) {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(1);
        self.connected_since_ms.store(now_ms, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(AgentState::Connected);
    }

    pub(crate) fn on_disconnected(&self) {
        if self.connected_since_ms.swap(0, Ordering::SeqCst) != 0 {
            self.total_disconnections.fetch_add(1, Ordering::SeqCst);
        }
        self.set_state(AgentState::Disconnected);
    }

    pub(crate) fn set_reconnect_attempt(&self, attempt: u32) {
        self.reconnect_attempt.store(attempt, Ordering::SeqCst);
    }

    fn connected_since(&self) -> Option<SystemTime> {
        match self.connected_since_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Device-resident agent
pub struct Agent {
    config: Arc<AgentConfig>,
    node_id: String,
    device_id: String,
    device_model: String,
    store: Arc<dyn KeyValueStore>,
    ip_lookup: Option<Arc<dyn IpLookup>>,
    shared: Arc<AgentShared>,
    tunnels: Arc<TunnelManager>,
    running: Mutex<Option<Running>>,
}

impl Agent {
    /// Node id and device model fall back to the identity provider when
    /// the config leaves them unset.
    pub fn new(
        config: AgentConfig,
        identity: Arc<dyn DeviceIdentity>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let device_id = identity.device_id();
        let node_id = config
            .node_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| device_id.clone());
        let device_model = config
            .device_model
            .clone()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| identity.device_model());
        let tunnels = Arc::new(TunnelManager::new(config.tunnel.clone()));

        Self {
            config: Arc::new(config),
            node_id,
            device_id,
            device_model,
            store,
            ip_lookup: None,
            shared: Arc::new(AgentShared::new()),
            tunnels,
            running: Mutex::new(None),
        }
    }

    /// Replace the HTTP IP/geolocation lookup
    pub fn with_ip_lookup(mut self, lookup: Arc<dyn IpLookup>) -> Self {
        self.ip_lookup = Some(lookup);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn device_model(&self) -> &str {
        &self.device_model
    }

    /// Spawn the connection supervisor. Fails if already running or if the
    /// server URL is unusable.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Err(AgentError::AlreadyRunning);
            }
        }

        WebSocketConfig::new(&self.config.server_url)?;

        let proxy = Arc::new(ProxyExecutor::new(self.config.proxy.clone())?);
        let pool = WorkPool::from_config(&self.config.pool);
        let ip_reporter = self.ip_reporter()?;

        let cancel = CancellationToken::new();
        let supervisor = Supervisor::new(
            Arc::clone(&self.config),
            self.node_id.clone(),
            self.device_model.clone(),
            Arc::clone(&self.shared),
            Arc::clone(&self.tunnels),
            proxy,
            pool,
            ip_reporter,
        );

        info!(
            node_id = %self.node_id,
            server = %self.config.server_url,
            "Starting agent"
        );

        let task = tokio::spawn(supervisor.run(cancel.clone()));
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop the supervisor, close every tunnel and the control connection.
    /// Does nothing if the agent is not running.
    pub async fn stop(&self) {
        let Some(Running { cancel, task }) = self.running.lock().await.take() else {
            return;
        };

        info!(node_id = %self.node_id, "Stopping agent");
        cancel.cancel();
        if let Err(e) = task.await {
            debug!(error = %e, "Supervisor task ended abnormally");
        }
        self.tunnels.close_all("agent stopped");
        self.shared.set_state(AgentState::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| !running.task.is_finished())
            .unwrap_or(false)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == AgentState::Connected
    }

    pub fn state(&self) -> AgentState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.shared.state_tx.subscribe()
    }

    pub fn active_tunnel_count(&self) -> usize {
        self.tunnels.active_count()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            state: self.shared.state(),
            total_connections: self.shared.total_connections.load(Ordering::SeqCst),
            total_disconnections: self.shared.total_disconnections.load(Ordering::SeqCst),
            reconnect_attempt: self.shared.reconnect_attempt.load(Ordering::SeqCst),
            connected_since: self.shared.connected_since(),
            active_tunnels: self.tunnels.active_count(),
        }
    }

    fn ip_reporter(&self) -> Result<Option<Arc<IpInfoReporter>>, AgentError> {
        if !self.config.ip_info.enabled {
            return Ok(None);
        }
        let lookup: Arc<dyn IpLookup> = match &self.ip_lookup {
            Some(lookup) => Arc::clone(lookup),
            None => Arc::new(HttpIpLookup::new(&self.config.ip_info)?),
        };
        Ok(Some(Arc::new(IpInfoReporter::new(
            lookup,
            Arc::clone(&self.store),
            self.config.ip_info.refresh_interval(),
            self.node_id.clone(),
            self.device_id.clone(),
            self.device_model.clone(),
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use crate::store::MemoryStore;

    fn build_agent(config: AgentConfig) -> Agent {
        Agent::new(
            config,
            Arc::new(StaticIdentity::new("device-1", "Pixel 8")),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn test_identity_fallbacks() {
        let agent = build_agent(AgentConfig::new("ws://127.0.0.1:1/"));
        assert_eq!(agent.node_id(), "device-1");
        assert_eq!(agent.device_model(), "Pixel 8");
        assert_eq!(agent.state(), AgentState::Idle);

        let mut config = AgentConfig::new("ws://127.0.0.1:1/");
        config.node_id = Some("node-7".to_string());
        config.device_model = Some(" ".to_string());
        let agent = build_agent(config);
        assert_eq!(agent.node_id(), "node-7");
        assert_eq!(agent.device_model(), "Pixel 8");
    }

    #[tokio::test]
    async fn test_start_rejects_bad_url() {
        let agent = build_agent(AgentConfig::new("http://example.com/"));
        assert!(matches!(agent.start().await, Err(AgentError::Transport(_))));
        assert!(!agent.is_running().await);
    }

    #[test]
    fn test_shared_counters() {
        let shared = AgentShared::new();
        let mut rx = shared.state_tx.subscribe();

        shared.on_disconnected();
        assert_eq!(shared.total_disconnections.load(Ordering::SeqCst), 0);

        shared.set_reconnect_attempt(3);
        shared.on_connected();
        assert_eq!(shared.state(), AgentState::Connected);
        assert_eq!(shared.reconnect_attempt.load(Ordering::SeqCst), 0);
        assert!(shared.connected_since().is_some());
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), AgentState::Connected);

        shared.on_disconnected();
        assert_eq!(shared.total_connections.load(Ordering::SeqCst), 1);
        assert_eq!(shared.total_disconnections.load(Ordering::SeqCst), 1);
        assert!(shared.connected_since().is_none());
    }
}
