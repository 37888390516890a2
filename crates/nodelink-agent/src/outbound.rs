//! Typed send path to the gateway
//!
//! Wraps the connection's [`WebSocketSender`] so callers hand over protocol
//! values instead of raw frames. Cloning is cheap; every clone funnels into
//! the same writer task.

use bytes::Bytes;
use nodelink_proto::{ControlMessage, TunnelData, TunnelFrame};
use nodelink_transport_websocket::WebSocketSender;
use tracing::trace;

use crate::agent::AgentError;
use crate::config::DataEncoding;

#[derive(Clone, Debug)]
pub struct Outbound {
    sender: WebSocketSender,
}

impl Outbound {
    pub fn new(sender: WebSocketSender) -> Self {
        Self { sender }
    }

    /// Send a JSON control message as a text frame
    pub async fn send_message(&self, message: &ControlMessage) -> Result<(), AgentError> {
        let text = message.to_json()?;
        trace!(message_type = message.type_name(), len = text.len(), "Sending message");
        self.sender.send_text(text).await?;
        Ok(())
    }

    /// Send a binary tunnel frame
    pub async fn send_tunnel_frame(&self, frame: &TunnelFrame) -> Result<(), AgentError> {
        let encoded = frame.encode()?;
        self.sender.send_binary(encoded).await?;
        Ok(())
    }

    /// Forward target bytes using the configured encoding
    pub async fn send_tunnel_data(
        &self,
        encoding: DataEncoding,
        tunnel_id: &str,
        payload: Bytes,
    ) -> Result<(), AgentError> {
        match encoding {
            DataEncoding::Binary => {
                self.send_tunnel_frame(&TunnelFrame::data(tunnel_id, payload))
                    .await
            }
            DataEncoding::Json => {
                self.send_message(&ControlMessage::TunnelData {
                    data: TunnelData::payload(tunnel_id, &payload),
                })
                .await
            }
        }
    }

    /// Signal end of the target stream using the configured encoding
    pub async fn send_tunnel_eof(
        &self,
        encoding: DataEncoding,
        tunnel_id: &str,
    ) -> Result<(), AgentError> {
        match encoding {
            DataEncoding::Binary => self.send_tunnel_frame(&TunnelFrame::eof(tunnel_id)).await,
            DataEncoding::Json => {
                self.send_message(&ControlMessage::TunnelData {
                    data: TunnelData::eof(tunnel_id),
                })
                .await
            }
        }
    }

    /// Best-effort close frame; later sends fail
    pub async fn close(&self, code: u16, reason: &str) -> Result<(), AgentError> {
        self.sender.close(code, reason).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
