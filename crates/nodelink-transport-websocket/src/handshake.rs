//! HTTP/1.1 upgrade handshake
//!
//! The response head is read one byte at a time so that nothing past the
//! terminating blank line is consumed; the first WebSocket frame may follow
//! immediately in the same segment.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{TransportError, TransportResult};

const MAX_LINE_LEN: usize = 8192;
const MAX_HEADER_LINES: usize = 100;

/// Parsed upgrade response head
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub status_line: String,
    pub headers: Vec<(String, String)>,
}

impl HandshakeResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Random 16-byte nonce, base64 encoded
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Render the upgrade request
pub fn build_request(host: &str, path: &str, key: &str, headers: &[(String, String)]) -> String {
    let mut request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n",
        path, host, key
    );
    for (name, value) in headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

/// Read a single CRLF (or bare LF) terminated line.
///
/// Returns `Ok(None)` on EOF before any byte was read.
pub async fn read_line<R>(reader: &mut R) -> TransportResult<Option<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_LINE_LEN {
            return Err(TransportError::HandshakeFailed(format!(
                "Response line exceeds {} bytes",
                MAX_LINE_LEN
            )));
        }
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Send the upgrade request and validate the `101` response
pub async fn perform_handshake<S>(
    stream: &mut S,
    host: &str,
    path: &str,
    headers: &[(String, String)],
) -> TransportResult<HandshakeResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let key = generate_key();
    let request = build_request(host, path, &key, headers);

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let status_line = read_line(stream).await?.ok_or_else(|| {
        TransportError::HandshakeFailed("Connection closed before response".to_string())
    })?;

    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .map(|code| code == "101")
        .unwrap_or(false);
    if !status_ok {
        return Err(TransportError::HandshakeFailed(format!(
            "Unexpected status: {}",
            status_line
        )));
    }

    let mut response_headers = Vec::new();
    loop {
        let line = read_line(stream).await?.ok_or_else(|| {
            TransportError::HandshakeFailed("Connection closed during headers".to_string())
        })?;
        if line.is_empty() {
            break;
        }
        if response_headers.len() >= MAX_HEADER_LINES {
            return Err(TransportError::HandshakeFailed(
                "Too many response headers".to_string(),
            ));
        }
        if let Some((name, value)) = line.split_once(':') {
            response_headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    debug!(status = %status_line, headers = response_headers.len(), "WebSocket upgrade accepted");

    Ok(HandshakeResponse {
        status_line,
        headers: response_headers,
    })
}
