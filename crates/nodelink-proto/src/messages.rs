//! Control message types

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors produced while encoding or decoding control messages
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Main control protocol message enum
///
/// Every message is a JSON object whose `type` field selects the variant.
/// Types the agent does not know decode to [`ControlMessage::Unknown`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    // Agent -> gateway
    Hello {
        node_id: String,
        device_model: String,
        sdk_version: String,
    },
    Keepalive {
        uptime_sec: u64,
        active_tunnels: usize,
    },
    IpInfo(IpInfoReport),
    TunnelResponse {
        data: TunnelResponse,
    },
    ProxyResponse {
        data: ProxyResponse,
    },

    // Gateway -> agent
    Welcome,
    KeepaliveAck,
    /// Gateway asks the agent to disconnect and stay away for a while
    Cooldown {
        #[serde(default)]
        retry_after_sec: Option<u64>,
    },
    TunnelOpen {
        data: TunnelOpen,
    },
    ProxyRequest {
        data: ProxyRequest,
    },

    // Either direction
    TunnelData {
        data: TunnelData,
    },
    TunnelClose {
        data: TunnelClose,
    },

    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Decode a message from the text of a WebSocket frame
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the message as JSON text
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the message type, for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Hello { .. } => "hello",
            ControlMessage::Keepalive { .. } => "keepalive",
            ControlMessage::IpInfo(_) => "ip_info",
            ControlMessage::TunnelResponse { .. } => "tunnel_response",
            ControlMessage::ProxyResponse { .. } => "proxy_response",
            ControlMessage::Welcome => "welcome",
            ControlMessage::KeepaliveAck => "keepalive_ack",
            ControlMessage::Cooldown { .. } => "cooldown",
            ControlMessage::TunnelOpen { .. } => "tunnel_open",
            ControlMessage::ProxyRequest { .. } => "proxy_request",
            ControlMessage::TunnelData { .. } => "tunnel_data",
            ControlMessage::TunnelClose { .. } => "tunnel_close",
            ControlMessage::Unknown => "unknown",
        }
    }
}

/// Port as sent by the gateway: either a JSON number or a numeric string
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PortSpec {
    Number(i64),
    Text(String),
}

impl PortSpec {
    /// Resolve to a usable TCP port
    pub fn resolve(&self) -> Result<u16, String> {
        let value = match self {
            PortSpec::Number(n) => *n,
            PortSpec::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid port: {}", s))?,
        };

        match u16::try_from(value) {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(format!("invalid port: {}", value)),
        }
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Number(port as i64)
    }
}

/// Gateway asks the agent to open a raw TCP tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelOpen {
    pub tunnel_id: String,
    pub host: String,
    pub port: PortSpec,
}

/// Agent's reply to [`TunnelOpen`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelResponse {
    pub tunnel_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelResponse {
    pub fn ok(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(tunnel_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Tunnel payload on the JSON (legacy) path, base64 encoded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelData {
    pub tunnel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default)]
    pub eof: bool,
}

impl TunnelData {
    pub fn payload(tunnel_id: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            data: Some(BASE64.encode(bytes)),
            eof: false,
        }
    }

    pub fn eof(tunnel_id: impl Into<String>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            data: None,
            eof: true,
        }
    }

    /// Decode the base64 payload; a missing payload decodes to no bytes
    pub fn decode_payload(&self) -> Result<Vec<u8>, MessageError> {
        match self.data.as_deref() {
            Some(encoded) if !encoded.is_empty() => Ok(BASE64.decode(encoded)?),
            _ => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelClose {
    pub tunnel_id: String,
}

/// One-shot HTTP request executed by the agent on behalf of the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    /// Request body, base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProxyRequest {
    /// HTTP method, defaulting to GET
    pub fn method(&self) -> String {
        match self.method.as_deref() {
            Some(m) if !m.trim().is_empty() => m.trim().to_ascii_uppercase(),
            _ => "GET".to_string(),
        }
    }

    pub fn decode_body(&self) -> Result<Option<Vec<u8>>, MessageError> {
        match self.body.as_deref() {
            Some(encoded) if !encoded.is_empty() => Ok(Some(BASE64.decode(encoded)?)),
            _ => Ok(None),
        }
    }
}

/// Outcome of a [`ProxyRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Response body, base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<u64>,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResponse {
    pub fn success(
        request_id: impl Into<String>,
        status_code: u16,
        body: &[u8],
        latency_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            status_code: Some(status_code),
            body: Some(BASE64.encode(body)),
            bytes_read: Some(body.len() as u64),
            latency_ms,
            error: None,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            status_code: None,
            body: None,
            bytes_read: None,
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn decode_body(&self) -> Result<Vec<u8>, MessageError> {
        match self.body.as_deref() {
            Some(encoded) => Ok(BASE64.decode(encoded)?),
            None => Ok(Vec::new()),
        }
    }
}

/// Device network metadata, reported once per connect at most
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpInfoReport {
    pub node_id: String,
    pub device_id: String,
    pub device_model: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_fetch_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_fetch_ms: Option<u64>,
    pub ip_info: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_gateway_messages() {
        let msg = ControlMessage::from_json(r#"{"type":"welcome","server":"gw-1"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Welcome);

        let msg = ControlMessage::from_json(r#"{"type":"keepalive_ack"}"#).unwrap();
        assert_eq!(msg, ControlMessage::KeepaliveAck);

        let msg = ControlMessage::from_json(r#"{"type":"cooldown","retry_after_sec":30}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Cooldown {
                retry_after_sec: Some(30)
            }
        );

        let msg = ControlMessage::from_json(r#"{"type":"cooldown"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Cooldown {
                retry_after_sec: None
            }
        );
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = ControlMessage::from_json(r#"{"type":"node_stats","foo":1}"#).unwrap();
        assert_eq!(msg, ControlMessage::Unknown);
        assert_eq!(msg.type_name(), "unknown");
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(ControlMessage::from_json("{not json").is_err());
        assert!(ControlMessage::from_json(r#"{"no_type":true}"#).is_err());
    }

    #[test]
    fn test_tunnel_open_port_forms() {
        let msg = ControlMessage::from_json(
            r#"{"type":"tunnel_open","data":{"tunnel_id":"abc123","host":"example.com","port":"443"}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::TunnelOpen { data } => {
                assert_eq!(data.tunnel_id, "abc123");
                assert_eq!(data.host, "example.com");
                assert_eq!(data.port.resolve(), Ok(443));
            }
            other => panic!("Expected TunnelOpen, got {:?}", other),
        }

        let msg = ControlMessage::from_json(
            r#"{"type":"tunnel_open","data":{"tunnel_id":"abc123","host":"example.com","port":80}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::TunnelOpen { data } => assert_eq!(data.port.resolve(), Ok(80)),
            other => panic!("Expected TunnelOpen, got {:?}", other),
        }
    }

    #[test]
    fn test_port_validation() {
        assert!(PortSpec::Text("http".to_string()).resolve().is_err());
        assert!(PortSpec::Number(0).resolve().is_err());
        assert!(PortSpec::Number(70000).resolve().is_err());
        assert!(PortSpec::Number(-1).resolve().is_err());
        assert_eq!(
            PortSpec::Text("abc".to_string()).resolve(),
            Err("invalid port: abc".to_string())
        );
    }

    #[test]
    fn test_tunnel_response_shape() {
        let ok = ControlMessage::TunnelResponse {
            data: TunnelResponse::ok("abc123"),
        };
        let value: serde_json::Value = serde_json::from_str(&ok.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type":"tunnel_response","data":{"tunnel_id":"abc123","success":true}})
        );

        let failed = ControlMessage::TunnelResponse {
            data: TunnelResponse::failed("abc123", "connection refused"),
        };
        let value: serde_json::Value = serde_json::from_str(&failed.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["success"], json!(false));
        assert_eq!(value["data"]["error"], json!("connection refused"));
    }

    #[test]
    fn test_tunnel_data_payload() {
        let msg = ControlMessage::from_json(
            r#"{"type":"tunnel_data","data":{"tunnel_id":"t1","data":"aGVsbG8=","eof":false}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::TunnelData { data } => {
                assert!(!data.eof);
                assert_eq!(data.decode_payload().unwrap(), b"hello");
            }
            other => panic!("Expected TunnelData, got {:?}", other),
        }

        let eof = TunnelData::eof("t1");
        assert!(eof.decode_payload().unwrap().is_empty());

        let bad = TunnelData {
            tunnel_id: "t1".to_string(),
            data: Some("!!!".to_string()),
            eof: false,
        };
        assert!(bad.decode_payload().is_err());
    }

    #[test]
    fn test_proxy_request_defaults() {
        let msg = ControlMessage::from_json(
            r#"{"type":"proxy_request","data":{"request_id":"r1","url":"http://example.com/"}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::ProxyRequest { data } => {
                assert_eq!(data.method(), "GET");
                assert_eq!(data.url.as_deref(), Some("http://example.com/"));
                assert!(data.decode_body().unwrap().is_none());
                assert!(data.headers.is_none());
            }
            other => panic!("Expected ProxyRequest, got {:?}", other),
        }
    }

    #[test]
    fn test_proxy_response_shape() {
        let resp = ProxyResponse::success("r1", 200, b"ok", 12);
        assert_eq!(resp.bytes_read, Some(2));
        assert_eq!(resp.decode_body().unwrap(), b"ok");

        let msg = ControlMessage::ProxyResponse {
            data: ProxyResponse::failure("r1", "node busy: work pool full", 0),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], json!("proxy_response"));
        assert_eq!(value["data"]["success"], json!(false));
        assert_eq!(value["data"]["latency_ms"], json!(0));
        assert!(value["data"].get("status_code").is_none());
    }

    #[test]
    fn test_hello_and_ip_info_shape() {
        let hello = ControlMessage::Hello {
            node_id: "node-1".to_string(),
            device_model: "Pixel 8 (Google)".to_string(),
            sdk_version: "1.0".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&hello.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], json!("hello"));
        assert_eq!(value["node_id"], json!("node-1"));

        let report = ControlMessage::IpInfo(IpInfoReport {
            node_id: "node-1".to_string(),
            device_id: "node-1".to_string(),
            device_model: "test".to_string(),
            ip: "203.0.113.7".to_string(),
            ip_fetch_ms: Some(40),
            info_fetch_ms: None,
            ip_info: json!({"country_code":"US"}),
        });
        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], json!("ip_info"));
        assert_eq!(value["ip_info"]["country_code"], json!("US"));
        assert!(value.get("info_fetch_ms").is_none());
    }
}
