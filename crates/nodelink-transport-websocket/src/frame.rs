//! WebSocket frame codec
//!
//! Encodes and decodes single RFC 6455 frames over any async byte stream.
//! Frames sent by the agent are always masked (client role); frames from the
//! peer may or may not be.
//!
//! Header layout:
//! - byte 0: FIN bit + opcode (low 4 bits)
//! - byte 1: MASK bit + 7-bit length selector
//! - 126 => 16-bit big-endian length follows, 127 => 64-bit big-endian length
//! - optional 4-byte mask key, then the payload

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{TransportError, TransportResult};

/// Largest payload representable with the 7-bit length field
pub const MAX_SHORT_PAYLOAD: usize = 125;

/// Largest payload representable with the 16-bit extended length field
pub const MAX_MEDIUM_PAYLOAD: usize = 65535;

/// Default ceiling for inbound frame payloads (16MB)
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(TransportError::ProtocolError(format!(
                "Reserved opcode: {:#x}",
                other
            ))),
        }
    }
}

/// A single WebSocket frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: Bytes) -> Self {
        Self {
            fin: true,
            opcode,
            payload,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(payload: Bytes) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    pub fn ping(payload: Bytes) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Close frame carrying a status code and UTF-8 reason
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        buf.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, buf.freeze())
    }
}

/// Status code and reason decoded from a close frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseFrame {
    pub fn parse(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self {
                code: None,
                reason: String::new(),
            };
        }
        Self {
            code: Some(u16::from_be_bytes([payload[0], payload[1]])),
            reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
        }
    }
}

impl std::fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}:{}", code, self.reason),
            None => write!(f, "no status"),
        }
    }
}

/// XOR `mask` cyclically over `buf`
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Encode a frame to bytes, masking the payload when a key is given
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Bytes {
    let len = frame.payload.len();
    let mut buf = BytesMut::with_capacity(14 + len);

    let first = if frame.fin { FIN_BIT } else { 0 } | frame.opcode as u8;
    buf.put_u8(first);

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if len <= MAX_SHORT_PAYLOAD {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= MAX_MEDIUM_PAYLOAD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(&frame.payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(&frame.payload),
    }

    buf.freeze()
}

/// Write one client frame with a fresh random mask
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> TransportResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mask: [u8; 4] = rand::random();
    let encoded = encode_frame(frame, Some(mask));

    writer.write_all(&encoded).await?;
    writer.flush().await?;

    trace!(
        opcode = ?frame.opcode,
        payload_len = frame.payload.len(),
        "Wrote frame"
    );
    Ok(())
}

/// Read exactly one frame.
///
/// `read_exact` keeps reading across short reads, so a frame split over many
/// TCP segments is reassembled here. EOF before the first header byte is
/// reported as [`TransportError::ConnectionClosed`].
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> TransportResult<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 2];
    read_exact_or_closed(reader, &mut header).await?;

    let fin = header[0] & FIN_BIT != 0;
    let opcode = OpCode::try_from(header[0] & 0x0F)?;
    let masked = header[1] & MASK_BIT != 0;

    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            read_exact_or_closed(reader, &mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            read_exact_or_closed(reader, &mut ext).await?;
            let len = u64::from_be_bytes(ext);
            if len & (1 << 63) != 0 {
                return Err(TransportError::ProtocolError(
                    "64-bit payload length has its high bit set".to_string(),
                ));
            }
            len
        }
        short => short as u64,
    };

    if opcode.is_control() && (len > MAX_SHORT_PAYLOAD as u64 || !fin) {
        return Err(TransportError::ProtocolError(format!(
            "Invalid control frame: opcode={:?} len={} fin={}",
            opcode, len, fin
        )));
    }
    if len > max_payload as u64 {
        return Err(TransportError::ProtocolError(format!(
            "Frame too large: {} bytes (limit {})",
            len, max_payload
        )));
    }

    let mask = if masked {
        let mut key = [0u8; 4];
        read_exact_or_closed(reader, &mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len as usize];
    if !payload.is_empty() {
        read_exact_or_closed(reader, &mut payload).await?;
    }
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    trace!(opcode = ?opcode, payload_len = len, masked, "Read frame");

    Ok(Frame {
        fin,
        opcode,
        payload: Bytes::from(payload),
    })
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> TransportResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(TransportError::ConnectionClosed)
        }
        Err(e) => Err(TransportError::IoError(e)),
    }
}
