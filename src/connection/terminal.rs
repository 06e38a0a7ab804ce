//! Terminal connection - streaming PTY I/O.
//!
//! Output arrives on a reliable subscription either as live bytes or as a
//! chunked snapshot (a full terminal-state dump sent on attach/reconnect).
//! Snapshots are reassembled atomically: the output stream never sees a
//! partial snapshot, and a newer snapshot supersedes an unfinished one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::{ChannelKind, ChannelSpec, Connection, ConnectionError, ConnectionEvent, Payload, VariantState};
use crate::bridge::TransportBridge;
use crate::codec::snapshot::SnapshotChunk;
use crate::engine::bundle::PairingBundle;

/// An incomplete snapshot older than this is discarded.
const REASSEMBLY_TTL: Duration = Duration::from_secs(10);

struct PendingSnapshot {
    id: u32,
    total: u16,
    chunks: BTreeMap<u16, Vec<u8>>,
    started_at: Instant,
}

/// Reassembles chunked snapshots.
///
/// Atomicity rules: all `total_chunks` present -> emit the concatenation
/// exactly once; a chunk with a new snapshot id supersedes any in-progress
/// reassembly; an incomplete snapshot expires after 10 s and emits nothing.
pub(crate) struct SnapshotAssembler {
    current: Option<PendingSnapshot>,
}

impl SnapshotAssembler {
    fn new() -> Self {
        Self { current: None }
    }

    fn push(&mut self, chunk: SnapshotChunk, now: Instant) -> Option<Vec<u8>> {
        if chunk.total_chunks == 0 {
            log::warn!("Snapshot chunk with zero total, dropping");
            return None;
        }

        // Expire a stale reassembly before considering the new chunk.
        if self
            .current
            .as_ref()
            .is_some_and(|p| now.duration_since(p.started_at) > REASSEMBLY_TTL)
        {
            let stale = self.current.take().expect("checked above");
            log::warn!(
                "Discarding incomplete snapshot {} ({}/{} chunks after timeout)",
                stale.id,
                stale.chunks.len(),
                stale.total
            );
        }

        // A new snapshot id supersedes whatever was in progress.
        if self
            .current
            .as_ref()
            .is_some_and(|p| p.id != chunk.snapshot_id)
        {
            let superseded = self.current.take().expect("checked above");
            log::debug!(
                "Snapshot {} superseded by {}, dropping partial buffer",
                superseded.id,
                chunk.snapshot_id
            );
        }

        let pending = self.current.get_or_insert_with(|| PendingSnapshot {
            id: chunk.snapshot_id,
            total: chunk.total_chunks,
            chunks: BTreeMap::new(),
            started_at: now,
        });

        pending.chunks.insert(chunk.chunk_idx, chunk.data);

        if pending.chunks.len() == pending.total as usize {
            let done = self.current.take().expect("just inserted");
            let mut assembled = Vec::new();
            for (_, data) in done.chunks {
                assembled.extend_from_slice(&data);
            }
            Some(assembled)
        } else {
            None
        }
    }
}

/// Per-terminal mutable state.
pub(crate) struct TerminalState {
    assembler: SnapshotAssembler,
}

impl TerminalState {
    pub(crate) fn new() -> Self {
        Self {
            assembler: SnapshotAssembler::new(),
        }
    }
}

/// Route a terminal payload.
pub(crate) async fn handle_payload(conn: &Connection, payload: Payload) {
    match payload {
        Payload::Output(bytes) => {
            conn.emit(ConnectionEvent::Output(bytes));
        }
        Payload::Snapshot(chunk) => {
            let assembled = {
                let mut variant = conn.variant().lock().await;
                match &mut *variant {
                    VariantState::Terminal(state) => {
                        state.assembler.push(chunk, Instant::now())
                    }
                    _ => None,
                }
            };
            if let Some(bytes) = assembled {
                conn.emit(ConnectionEvent::Output(bytes));
            }
        }
        Payload::Json(value) => {
            conn.emit(ConnectionEvent::Message(value));
        }
        Payload::Text(text) => {
            conn.emit(ConnectionEvent::Message(Value::String(text)));
        }
    }
}

/// A terminal channel to one PTY on one agent.
#[derive(Debug)]
pub struct TerminalConnection {
    conn: Arc<Connection>,
}

impl TerminalConnection {
    /// Create a terminal connection. Rows/cols are part of the subscribe
    /// params so the peer sizes the PTY before the first output frame.
    pub fn new(
        bridge: Arc<TransportBridge>,
        hub_id: impl Into<String>,
        cable_url: impl Into<String>,
        agent_index: usize,
        pty_index: usize,
        rows: u16,
        cols: u16,
    ) -> Self {
        Self {
            conn: Connection::new(
                bridge,
                hub_id,
                cable_url,
                ChannelSpec::terminal(agent_index, pty_index, rows, cols),
            ),
        }
    }

    /// Wrap an existing core connection; must be a terminal channel.
    pub fn from_core(conn: Arc<Connection>) -> Option<Self> {
        (conn.kind() == ChannelKind::Terminal).then_some(Self { conn })
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

    /// Forward keystrokes to the peer verbatim. Buffered until the peer
    /// signals `input_ready`.
    pub async fn send_input(&self, bytes: &[u8]) -> bool {
        self.conn.send_input(bytes).await
    }

    /// Tell the peer the viewport changed.
    pub async fn send_resize(&self, rows: u16, cols: u16) -> bool {
        self.conn
            .send("resize", json!({ "rows": rows, "cols": cols }))
            .await
    }
}
