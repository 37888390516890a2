//! Nodelink Protocol Definitions
//!
//! This crate defines the wire protocol spoken between a node agent and its
//! gateway over the control connection:
//!
//! - JSON control messages carried in WebSocket text frames, tagged by `type`
//! - the compact binary tunnel frame used on the high-throughput data path

pub mod messages;
pub mod tunnel_frame;

pub use messages::*;
pub use tunnel_frame::{
    validate_tunnel_id, TunnelFrame, TunnelFrameError, TUNNEL_FRAME_HEADER_LEN, TUNNEL_ID_LEN,
};

/// Version reported to the gateway in the `hello` message
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cooldown applied when the gateway omits `retry_after_sec` (10 minutes)
pub const DEFAULT_COOLDOWN_SECS: u64 = 600;
