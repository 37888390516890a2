//! WebSocket client connection
//!
//! After the upgrade the stream is split in two. Outbound frames from any
//! number of tasks go through a bounded channel to one writer task, so frames
//! are never interleaved on the wire. The read half stays with whoever drives
//! [`WebSocketReader::recv`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::config::WebSocketConfig;
use crate::frame::{read_frame, write_frame, CloseFrame, Frame, OpCode};
use crate::handshake::perform_handshake;
use crate::{TransportError, TransportResult};

/// Outbound frames queued ahead of the writer task
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Byte stream the connection runs over (plain TCP, TLS, or an in-memory pipe)
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Data-bearing message delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Close(CloseFrame),
}

/// Connection statistics
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub uptime: Duration,
}

#[derive(Debug)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    created_at: Instant,
}

/// Established WebSocket connection
pub struct WebSocketConnection {
    connection_id: String,
    remote_addr: Option<SocketAddr>,
    connected_at: SystemTime,
    sender: WebSocketSender,
    reader: WebSocketReader,
    writer: WriterHandle,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl WebSocketConnection {
    /// Open TCP (+TLS for `wss`) and perform the upgrade handshake.
    ///
    /// Each phase is bounded by `connect_timeout`. On failure the socket is
    /// dropped and nothing is left running.
    pub async fn connect(config: &WebSocketConfig) -> TransportResult<Self> {
        config.validate()?;

        let host = config.host()?;
        let dial_host = host.trim_start_matches('[').trim_end_matches(']');
        let port = config.port();

        debug!("Connecting to {}:{}", dial_host, port);

        let tcp = timeout(config.connect_timeout, TcpStream::connect((dial_host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| {
                TransportError::ConnectionError(format!("{}:{}: {}", dial_host, port, e))
            })?;
        configure_socket(&tcp)?;
        let remote_addr = tcp.peer_addr().ok();

        let mut stream: BoxedStream = if config.is_secure() {
            let connector = config.build_tls_connector()?;
            let server_name = rustls::pki_types::ServerName::try_from(dial_host.to_string())
                .map_err(|e| {
                    TransportError::TlsError(format!("Invalid server name {}: {}", dial_host, e))
                })?;

            let tls = timeout(config.connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::TlsError(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let host_header = config.host_header()?;
        timeout(
            config.connect_timeout,
            perform_handshake(
                &mut stream,
                &host_header,
                &config.request_path(),
                &config.headers,
            ),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(Self::from_stream(stream, remote_addr, config))
    }

    /// Wrap a stream whose upgrade handshake has already completed
    pub fn from_stream<S>(stream: S, remote_addr: Option<SocketAddr>, config: &WebSocketConfig) -> Self
    where
        S: AsyncStream + 'static,
    {
        let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
        let counters = Arc::new(Counters {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            created_at: Instant::now(),
        });
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(writer_task(
            write_half,
            frame_rx,
            counters.clone(),
            closed.clone(),
            connection_id.clone(),
        ));

        let sender = WebSocketSender {
            connection_id: Arc::from(connection_id.as_str()),
            frame_tx,
            counters: counters.clone(),
            closed,
        };

        let reader = WebSocketReader {
            connection_id: connection_id.clone(),
            inner: read_half,
            sender: sender.clone(),
            counters,
            read_timeout: config.read_timeout,
            max_frame_size: config.max_frame_size,
        };

        debug!("[{}] WebSocket connection established", connection_id);

        Self {
            connection_id,
            remote_addr,
            connected_at: SystemTime::now(),
            sender,
            reader,
            writer: WriterHandle { task },
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Wall-clock time the upgrade completed
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    pub fn sender(&self) -> WebSocketSender {
        self.sender.clone()
    }

    pub fn into_parts(self) -> (WebSocketSender, WebSocketReader, WriterHandle) {
        (self.sender, self.reader, self.writer)
    }
}

fn configure_socket(tcp: &TcpStream) -> TransportResult<()> {
    tcp.set_nodelay(true)?;
    socket2::SockRef::from(tcp).set_keepalive(true)?;
    Ok(())
}

/// Writer task - sends queued frames until a close frame or write error
async fn writer_task(
    mut sink: WriteHalf<BoxedStream>,
    mut rx: mpsc::Receiver<Frame>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    conn_id: String,
) {
    while let Some(frame) = rx.recv().await {
        let is_close = frame.opcode == OpCode::Close;
        let len = frame.payload.len() as u64;

        if let Err(e) = write_frame(&mut sink, &frame).await {
            error!("[{}] WebSocket send error: {}", conn_id, e);
            break;
        }
        counters.bytes_sent.fetch_add(len, Ordering::Relaxed);

        if is_close {
            break;
        }
    }

    debug!("[{}] WebSocket writer task ended", conn_id);
    closed.store(true, Ordering::SeqCst);
    rx.close();
    let _ = sink.shutdown().await;
}

/// Cloneable handle for sending frames; all clones feed the same writer task
#[derive(Clone)]
pub struct WebSocketSender {
    connection_id: Arc<str>,
    frame_tx: mpsc::Sender<Frame>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for WebSocketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSender")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WebSocketSender {
    /// Queue a frame; waits while the outbound queue is full
    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> TransportResult<()> {
        self.send(Frame::text(text)).await
    }

    pub async fn send_binary(&self, payload: Bytes) -> TransportResult<()> {
        self.send(Frame::binary(payload)).await
    }

    /// Queue a close frame; later sends fail with `ConnectionClosed`
    pub async fn close(&self, code: u16, reason: &str) -> TransportResult<()> {
        let result = self.send(Frame::close(code, reason)).await;
        self.closed.store(true, Ordering::SeqCst);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.frame_tx.is_closed()
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            uptime: self.counters.created_at.elapsed(),
        }
    }
}

/// Read side of the connection
pub struct WebSocketReader {
    connection_id: String,
    inner: ReadHalf<BoxedStream>,
    sender: WebSocketSender,
    counters: Arc<Counters>,
    read_timeout: Duration,
    max_frame_size: usize,
}

impl WebSocketReader {
    /// Receive the next text, binary or close message.
    ///
    /// Pings are answered with a pong carrying the same payload and pongs are
    /// swallowed. Fragmented messages are not supported and are dropped. A
    /// silent peer past `read_timeout` yields [`TransportError::Timeout`].
    ///
    /// Not cancel safe: dropping the future mid-frame desynchronizes the
    /// stream, so only abandon it when the connection is being torn down.
    pub async fn recv(&mut self) -> TransportResult<Message> {
        loop {
            let frame = timeout(
                self.read_timeout,
                read_frame(&mut self.inner, self.max_frame_size),
            )
            .await
            .map_err(|_| TransportError::Timeout)??;

            self.counters
                .bytes_received
                .fetch_add(frame.payload.len() as u64, Ordering::Relaxed);

            if !frame.fin {
                warn!(
                    "[{}] Dropping fragmented {:?} frame ({} bytes)",
                    self.connection_id,
                    frame.opcode,
                    frame.payload.len()
                );
                continue;
            }

            match frame.opcode {
                OpCode::Text => match String::from_utf8(frame.payload.to_vec()) {
                    Ok(text) => return Ok(Message::Text(text)),
                    Err(_) => {
                        warn!("[{}] Dropping text frame with invalid UTF-8", self.connection_id);
                    }
                },
                OpCode::Binary => return Ok(Message::Binary(frame.payload)),
                OpCode::Close => return Ok(Message::Close(CloseFrame::parse(&frame.payload))),
                OpCode::Ping => {
                    trace!("[{}] Ping ({} bytes)", self.connection_id, frame.payload.len());
                    if let Err(e) = self.sender.send(Frame::pong(frame.payload)).await {
                        debug!("[{}] Failed to answer ping: {}", self.connection_id, e);
                    }
                }
                OpCode::Pong => {
                    trace!("[{}] Pong", self.connection_id);
                }
                OpCode::Continuation => {
                    warn!(
                        "[{}] Dropping stray continuation frame ({} bytes)",
                        self.connection_id,
                        frame.payload.len()
                    );
                }
            }
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

/// Owns the writer task so a session can wait for queued frames to flush
pub struct WriterHandle {
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Wait up to `grace` for the writer to drain, then abort it
    pub async fn shutdown(mut self, grace: Duration) {
        if timeout(grace, &mut self.task).await.is_err() {
            debug!("WebSocket writer did not finish within {:?}, aborting", grace);
            self.task.abort();
        }
    }
}
