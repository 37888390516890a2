//! Binary tunnel frame
//!
//! High-throughput tunnel payloads travel in WebSocket binary frames using a
//! fixed layout instead of JSON + base64:
//!
//! - 36 bytes: tunnel id (UTF-8, NUL padded when shorter)
//! - 1 byte: flag (0x00 = data, 0x01 = EOF)
//! - Rest: raw payload

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of the tunnel id field (the text length of a UUID)
pub const TUNNEL_ID_LEN: usize = 36;

/// Tunnel id field + flag byte
pub const TUNNEL_FRAME_HEADER_LEN: usize = TUNNEL_ID_LEN + 1;

pub const FLAG_DATA: u8 = 0x00;
pub const FLAG_EOF: u8 = 0x01;

/// Binary tunnel frame errors
#[derive(Debug, Error, PartialEq)]
pub enum TunnelFrameError {
    #[error("Invalid tunnel id: {0}")]
    InvalidTunnelId(String),

    #[error("Tunnel frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid tunnel frame flag: {0:#04x}")]
    InvalidFlag(u8),
}

/// Check that a tunnel id fits the fixed-width id field.
///
/// Ids longer than the field are rejected rather than truncated, since a
/// truncated id could alias another tunnel.
pub fn validate_tunnel_id(tunnel_id: &str) -> Result<(), TunnelFrameError> {
    if tunnel_id.is_empty() {
        return Err(TunnelFrameError::InvalidTunnelId(
            "tunnel id is empty".to_string(),
        ));
    }
    if tunnel_id.len() > TUNNEL_ID_LEN {
        return Err(TunnelFrameError::InvalidTunnelId(format!(
            "tunnel id is {} bytes, field holds {}",
            tunnel_id.len(),
            TUNNEL_ID_LEN
        )));
    }
    if tunnel_id.as_bytes().contains(&0) {
        return Err(TunnelFrameError::InvalidTunnelId(
            "tunnel id contains NUL".to_string(),
        ));
    }
    // Decoding strips trailing whitespace as padding, so it can't be part of an id
    if tunnel_id.bytes().any(|b| b.is_ascii_whitespace()) {
        return Err(TunnelFrameError::InvalidTunnelId(
            "tunnel id contains whitespace".to_string(),
        ));
    }
    Ok(())
}

/// A decoded binary tunnel frame
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelFrame {
    pub tunnel_id: String,
    pub eof: bool,
    pub payload: Bytes,
}

impl TunnelFrame {
    pub fn data(tunnel_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            eof: false,
            payload,
        }
    }

    pub fn eof(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            eof: true,
            payload: Bytes::new(),
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, TunnelFrameError> {
        validate_tunnel_id(&self.tunnel_id)?;

        let id = self.tunnel_id.as_bytes();
        let mut buf = BytesMut::with_capacity(TUNNEL_FRAME_HEADER_LEN + self.payload.len());
        buf.put_slice(id);
        buf.put_bytes(0, TUNNEL_ID_LEN - id.len());
        buf.put_u8(if self.eof { FLAG_EOF } else { FLAG_DATA });
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Decode frame from the payload of a binary WebSocket frame
    pub fn decode(mut buf: Bytes) -> Result<Self, TunnelFrameError> {
        if buf.len() < TUNNEL_FRAME_HEADER_LEN {
            return Err(TunnelFrameError::TooShort(buf.len()));
        }

        let header = buf.split_to(TUNNEL_FRAME_HEADER_LEN);
        let id_field = &header[..TUNNEL_ID_LEN];
        let id_len = id_field
            .iter()
            .rposition(|b| *b != 0 && !b.is_ascii_whitespace())
            .map(|pos| pos + 1)
            .unwrap_or(0);

        let tunnel_id = std::str::from_utf8(&id_field[..id_len])
            .map_err(|_| TunnelFrameError::InvalidTunnelId("tunnel id is not UTF-8".to_string()))?
            .to_string();
        validate_tunnel_id(&tunnel_id)?;

        let eof = match header[TUNNEL_ID_LEN] {
            FLAG_DATA => false,
            FLAG_EOF => true,
            other => return Err(TunnelFrameError::InvalidFlag(other)),
        };

        Ok(Self {
            tunnel_id,
            eof,
            payload: buf,
        })
    }
}
