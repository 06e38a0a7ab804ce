//! Preview connection - HTTP tunneling over multiplexed streams.
//!
//! One subscription carries many logical streams, each a TCP connection the
//! peer opens to a local dev server. `fetch` opens a stream, writes a raw
//! HTTP/1.1 request, and feeds response bytes into a parser the caller
//! supplies; the core never interprets HTTP itself.
//!
//! ```text
//! Client                       CLI                        Dev Server
//!    |                          |                              |
//!    |-- OPEN(stream, port) --->|                              |
//!    |<---- OPENED(stream) -----|-- connect localhost:port --->|
//!    |-- DATA(request bytes) -->|------------------------------>
//!    |<---- DATA(response) -----|<------------------------------
//!    |-- CLOSE(stream) -------->|                              |
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChannelKind, ChannelSpec, Connection, ConnectionError, ConnectionEvent, Payload, VariantState};
use crate::bridge::TransportBridge;
use crate::codec::stream::{self, StreamFrame};
use crate::engine::bundle::PairingBundle;

/// Write chunk size for request bodies (cross-implementation SCTP-safe
/// message limit).
const MAX_CHUNK_SIZE: usize = 16384;

/// Feeds on HTTP/1.1 response bytes; supplied by the embedder.
///
/// `push` returns true once the response is complete. `finish` is called if
/// the stream closes first; returning true accepts the bytes seen so far as
/// a complete response (connection-delimited bodies).
pub trait HttpResponseParser: Send {
    /// Consume a chunk of response bytes.
    fn push(&mut self, chunk: &[u8]) -> anyhow::Result<bool>;

    /// The stream closed; is what we have a usable response?
    fn finish(&mut self) -> anyhow::Result<bool>;
}

/// An HTTP request to tunnel.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    /// Request method (GET, POST, ...).
    pub method: String,
    /// Path plus query string.
    pub path: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
}

/// Errors from [`PreviewConnection::fetch`].
#[derive(Debug)]
pub enum FetchError {
    /// The deadline expired; the stream was closed.
    Timeout,
    /// The stream closed before the response completed.
    StreamClosed,
    /// The peer could not open the stream (connection refused, bad port).
    Refused(String),
    /// The response parser rejected the bytes.
    Parser(String),
    /// The request could not be written.
    SendFailed,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "fetch timed out"),
            Self::StreamClosed => write!(f, "stream closed before response completed"),
            Self::Refused(reason) => write!(f, "stream refused: {reason}"),
            Self::Parser(reason) => write!(f, "response parse failed: {reason}"),
            Self::SendFailed => write!(f, "request could not be sent"),
        }
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Opened,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

/// Per-preview mutable state: live streams keyed by local stream id.
pub(crate) struct PreviewState {
    next_stream: u16,
    streams: HashMap<u16, mpsc::UnboundedSender<StreamEvent>>,
}

impl PreviewState {
    pub(crate) fn new() -> Self {
        Self {
            next_stream: 1,
            streams: HashMap::new(),
        }
    }
}

/// Route a preview stream frame to its waiting fetch.
pub(crate) async fn handle_stream_frame(conn: &Connection, frame: StreamFrame) {
    let event = match frame.frame_type {
        stream::OPENED => StreamEvent::Opened,
        stream::DATA => StreamEvent::Data(frame.payload),
        stream::CLOSE => StreamEvent::Closed,
        stream::ERROR => {
            StreamEvent::Error(String::from_utf8_lossy(&frame.payload).into_owned())
        }
        other => {
            log::warn!("Unexpected stream frame type 0x{other:02x} from peer");
            return;
        }
    };

    let mut variant = conn.variant().lock().await;
    let VariantState::Preview(state) = &mut *variant else {
        return;
    };
    let Some(tx) = state.streams.get(&frame.stream_id) else {
        log::debug!("Frame for unknown stream {}, ignoring", frame.stream_id);
        return;
    };
    if tx.send(event).is_err() {
        state.streams.remove(&frame.stream_id);
    }
}

/// Route non-stream preview payloads (status messages and the like).
pub(crate) async fn handle_payload(conn: &Connection, payload: Payload) {
    match payload {
        Payload::Json(value) => conn.emit(ConnectionEvent::Message(value)),
        Payload::Text(text) => conn.emit(ConnectionEvent::Message(Value::String(text))),
        other => log::debug!("Unexpected payload on preview channel: {other:?}"),
    }
}

/// Serialize a request as raw HTTP/1.1 bytes.
///
/// A `Connection: close` header is added unless the caller set one, so
/// parsers can treat stream close as end-of-body.
fn serialize_request(spec: &HttpRequestSpec, port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", spec.method, spec.path).as_bytes());

    let mut has_host = false;
    let mut has_connection = false;
    let mut has_length = false;
    for (name, value) in &spec.headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    if !has_host {
        out.extend_from_slice(format!("Host: localhost:{port}\r\n").as_bytes());
    }
    if !has_connection {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    if let Some(body) = &spec.body {
        if !has_length {
            out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
    }
    out.extend_from_slice(b"\r\n");
    if let Some(body) = &spec.body {
        out.extend_from_slice(body);
    }
    out
}

/// An HTTP preview channel to a port on the peer.
#[derive(Debug)]
pub struct PreviewConnection {
    conn: Arc<Connection>,
    port: u16,
}

impl PreviewConnection {
    /// Create a preview connection tunneling to `port` on the peer.
    pub fn new(
        bridge: Arc<TransportBridge>,
        hub_id: impl Into<String>,
        cable_url: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            conn: Connection::new(bridge, hub_id, cable_url, ChannelSpec::preview(port)),
            port,
        }
    }

    /// Wrap an existing core connection; must be a preview channel.
    pub fn from_core(conn: Arc<Connection>, port: u16) -> Option<Self> {
        (conn.kind() == ChannelKind::Preview).then_some(Self { conn, port })
    }

    /// The shared lifecycle core.
    pub fn core(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Bootstrap the connection (see [`Connection::initialize`]).
    pub async fn initialize(&self, bundle: Option<PairingBundle>) -> Result<(), ConnectionError> {
        self.conn.initialize(bundle).await
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<ConnectionEvent> {
        self.conn.events()
    }

    /// Destroy the connection.
    pub fn destroy(&self) {
        self.conn.destroy();
    }

    /// Tunnel one HTTP request: open a stream, write the request, feed
    /// response bytes into `parser` until it reports completion or the
    /// stream closes. On timeout the stream is closed and the fetch
    /// rejected.
    pub async fn fetch<P: HttpResponseParser>(
        &self,
        request: HttpRequestSpec,
        mut parser: P,
        timeout: Duration,
    ) -> Result<P, FetchError> {
        let (stream_id, mut rx) = {
            let mut variant = self.conn.variant().lock().await;
            let VariantState::Preview(state) = &mut *variant else {
                return Err(FetchError::SendFailed);
            };
            let stream_id = state.next_stream;
            state.next_stream = state.next_stream.wrapping_add(1).max(1);
            let (tx, rx) = mpsc::unbounded_channel();
            state.streams.insert(stream_id, tx);
            (stream_id, rx)
        };

        let result = tokio::time::timeout(
            timeout,
            self.run_fetch(stream_id, &mut rx, &request, &mut parser),
        )
        .await;

        // Always release the stream slot.
        {
            let mut variant = self.conn.variant().lock().await;
            if let VariantState::Preview(state) = &mut *variant {
                state.streams.remove(&stream_id);
            }
        }

        match result {
            Ok(Ok(())) => Ok(parser),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Best-effort close so the peer tears the TCP side down.
                let _ = self
                    .conn
                    .send_stream(StreamFrame {
                        frame_type: stream::CLOSE,
                        stream_id,
                        payload: Vec::new(),
                    })
                    .await;
                Err(FetchError::Timeout)
            }
        }
    }

    async fn run_fetch<P: HttpResponseParser>(
        &self,
        stream_id: u16,
        rx: &mut mpsc::UnboundedReceiver<StreamEvent>,
        request: &HttpRequestSpec,
        parser: &mut P,
    ) -> Result<(), FetchError> {
        // OPEN carries the target port.
        let opened = self
            .conn
            .send_stream(StreamFrame {
                frame_type: stream::OPEN,
                stream_id,
                payload: self.port.to_be_bytes().to_vec(),
            })
            .await;
        if !opened {
            return Err(FetchError::SendFailed);
        }

        match rx.recv().await {
            Some(StreamEvent::Opened) => {}
            Some(StreamEvent::Error(reason)) => return Err(FetchError::Refused(reason)),
            Some(StreamEvent::Closed) | None => return Err(FetchError::StreamClosed),
            Some(StreamEvent::Data(_)) => return Err(FetchError::StreamClosed),
        }

        // Write the request in SCTP-safe chunks.
        let raw = serialize_request(request, self.port);
        for chunk in raw.chunks(MAX_CHUNK_SIZE) {
            let sent = self
                .conn
                .send_stream(StreamFrame {
                    frame_type: stream::DATA,
                    stream_id,
                    payload: chunk.to_vec(),
                })
                .await;
            if !sent {
                return Err(FetchError::SendFailed);
            }
        }

        loop {
            match rx.recv().await {
                Some(StreamEvent::Data(bytes)) => {
                    match parser.push(&bytes) {
                        Ok(true) => {
                            let _ = self
                                .conn
                                .send_stream(StreamFrame {
                                    frame_type: stream::CLOSE,
                                    stream_id,
                                    payload: Vec::new(),
                                })
                                .await;
                            return Ok(());
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            let _ = self
                                .conn
                                .send_stream(StreamFrame {
                                    frame_type: stream::CLOSE,
                                    stream_id,
                                    payload: Vec::new(),
                                })
                                .await;
                            return Err(FetchError::Parser(e.to_string()));
                        }
                    }
                }
                Some(StreamEvent::Closed) | None => {
                    return match parser.finish() {
                        Ok(true) => Ok(()),
                        Ok(false) => Err(FetchError::StreamClosed),
                        Err(e) => Err(FetchError::Parser(e.to_string())),
                    };
                }
                Some(StreamEvent::Error(reason)) => return Err(FetchError::Refused(reason)),
                Some(StreamEvent::Opened) => continue,
            }
        }
    }
}
