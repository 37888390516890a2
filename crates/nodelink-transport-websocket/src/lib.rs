//! WebSocket client transport for the node agent
//!
//! A small RFC 6455 client built directly on TCP (optionally wrapped in
//! rustls): HTTP/1.1 upgrade handshake, frame codec with client masking,
//! and a connection split into a single-writer sender and a reader.

pub mod config;
pub mod connection;
pub mod frame;
pub mod handshake;

pub use config::WebSocketConfig;
pub use connection::{
    ConnectionStats, Message, WebSocketConnection, WebSocketReader, WebSocketSender, WriterHandle,
};
pub use frame::{CloseFrame, Frame, OpCode};

use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
