//! Nodelink device agent
//!
//! Keeps one outbound WebSocket control connection to a gateway and serves
//! the work the gateway sends down it:
//!
//! - **Tunnels**: raw TCP bridges to arbitrary targets, multiplexed over the
//!   control connection with a compact binary frame
//! - **Proxy requests**: one-shot HTTP requests executed on the gateway's behalf
//!
//! Both run on a bounded [`WorkPool`] that answers "busy" instead of queueing.
//! The connection is supervised: lost links are retried with exponential
//! backoff, and the gateway can impose a cooldown.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nodelink_agent::{Agent, AgentConfig, MemoryStore, StaticIdentity};
//!
//! # async fn run() -> Result<(), nodelink_agent::AgentError> {
//! let agent = Agent::new(
//!     AgentConfig::new("wss://gateway.example.com/node"),
//!     Arc::new(StaticIdentity::from_host()),
//!     Arc::new(MemoryStore::new()),
//! );
//! agent.start().await?;
//! // ...
//! agent.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod identity;
pub mod ip_info;
pub mod outbound;
pub mod pool;
pub mod proxy;
pub mod reconnect;
pub mod store;
mod supervisor;
pub mod tunnel;

pub use agent::{Agent, AgentError, AgentState, AgentStats};
pub use config::{
    AgentConfig, DataEncoding, IpInfoConfig, ProxyConfig, ReconnectConfig, TunnelConfig,
    WorkPoolConfig,
};
pub use identity::{DeviceIdentity, StaticIdentity};
pub use ip_info::{HttpIpLookup, IpInfoReporter, IpLookup};
pub use pool::{PoolError, WorkPool};
pub use proxy::ProxyExecutor;
pub use reconnect::{backoff_delay, ReconnectManager, Wait};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use tunnel::TunnelManager;
