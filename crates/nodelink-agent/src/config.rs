//! Agent configuration
//!
//! All durations are plain millisecond counts (`*_ms` keys) so the config can
//! be loaded from YAML/JSON by the host application. Every section has a
//! `Default` that matches the values the gateway expects from a stock agent.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Gateway URL (`ws://` or `wss://`)
    pub server_url: String,

    /// Node id announced to the gateway; falls back to the device id
    pub node_id: Option<String>,

    /// Device model announced to the gateway; falls back to the identity provider
    pub device_model: Option<String>,

    /// Extra headers sent with the WebSocket upgrade request
    pub headers: BTreeMap<String, String>,

    /// Skip TLS certificate verification (local testing only)
    pub insecure_skip_verify: bool,

    /// Control connection connect/TLS/handshake timeout
    pub connect_timeout_ms: u64,

    /// Control connection silence treated as a dead peer
    pub read_timeout_ms: u64,

    /// Interval between `keepalive` messages
    pub keepalive_interval_ms: u64,

    pub reconnect: ReconnectConfig,
    pub tunnel: TunnelConfig,
    pub proxy: ProxyConfig,
    pub pool: WorkPoolConfig,
    pub ip_info: IpInfoConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            node_id: None,
            device_model: None,
            headers: BTreeMap::new(),
            insecure_skip_verify: false,
            connect_timeout_ms: 15_000,
            read_timeout_ms: 90_000,
            keepalive_interval_ms: 55_000,
            reconnect: ReconnectConfig::default(),
            tunnel: TunnelConfig::default(),
            proxy: ProxyConfig::default(),
            pool: WorkPoolConfig::default(),
            ip_info: IpInfoConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

/// Reconnect schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay for the first retry; doubles per attempt
    pub base_delay_ms: u64,

    /// Upper bound on any backoff delay
    pub max_delay_ms: u64,

    /// Attempt count past which the delay stops doubling
    pub max_exponent: u32,

    /// Cooldown applied when the gateway sends `cooldown` without `retry_after_sec`
    pub default_cooldown_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 300_000,
            max_exponent: 10,
            default_cooldown_ms: nodelink_proto::DEFAULT_COOLDOWN_SECS * 1000,
        }
    }
}

/// Encoding used for target -> gateway tunnel data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataEncoding {
    /// Fixed-layout binary tunnel frames
    #[default]
    Binary,
    /// JSON `tunnel_data` messages with base64 payloads
    Json,
}

/// Tunnel bridging parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub connect_timeout_ms: u64,

    /// Target read wait before polling again; does not close the tunnel
    pub read_idle_timeout_ms: u64,

    pub read_buffer_size: usize,

    /// How long a closed tunnel id keeps swallowing stray frames
    pub recently_closed_grace_ms: u64,

    pub data_encoding: DataEncoding,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_idle_timeout_ms: 30_000,
            read_buffer_size: 32 * 1024,
            recently_closed_grace_ms: 10_000,
            data_encoding: DataEncoding::Binary,
        }
    }
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.read_idle_timeout_ms)
    }

    pub fn recently_closed_grace(&self) -> Duration {
        Duration::from_millis(self.recently_closed_grace_ms)
    }
}

/// Proxy executor parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub connect_timeout_ms: u64,

    /// Maximum wait for any single chunk of the response
    pub read_timeout_ms: u64,

    /// Response bytes beyond this are not read
    pub max_body_bytes: usize,

    pub max_redirects: usize,

    /// Sent unless the request carries its own `User-Agent`
    pub user_agent: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 30_000,
            max_body_bytes: 1024 * 1024,
            max_redirects: 10,
            user_agent: "Mozilla/5.0 (Linux; Android) AppleWebKit/537.36".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Work pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkPoolConfig {
    /// Fixed size; sized from host capacity when unset
    pub size: Option<usize>,
    pub min_size: usize,
    pub max_size: usize,
    /// Available memory above which the per-core multiplier doubles
    pub high_memory_threshold_bytes: u64,
}

impl Default for WorkPoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            min_size: 8,
            max_size: 32,
            high_memory_threshold_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Public IP / geolocation reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpInfoConfig {
    pub enabled: bool,

    /// Minimum time between network lookups; cached data is resent in between
    pub refresh_interval_ms: u64,

    /// Returns the caller's public IP as plain text
    pub ip_url: String,

    /// Geolocation page; the IP is appended to this prefix
    pub info_url_prefix: String,

    pub request_timeout_ms: u64,
}

impl Default for IpInfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_ms: 60 * 60 * 1000,
            ip_url: "https://ip2location.io/ip".to_string(),
            info_url_prefix: "https://www.ip2location.com/".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl IpInfoConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}
