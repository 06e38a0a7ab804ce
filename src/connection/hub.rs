//! Hub connection - the control plane.
//!
//! Routes agent lifecycle events to the owner and provides filesystem RPC
//! over the message channel: each request carries a UUID, responses are
//! correlated through a one-shot map, and timeouts evict the pending entry
//! so late responses are discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{ChannelKind, ChannelSpec, Connection, ConnectionError, ConnectionEvent, Payload, VariantState};
use crate::bridge::TransportBridge;
use crate::engine::bundle::PairingBundle;

/// Hub message types routed as named events.
const ROUTED_EVENTS: [&str; 5] = [
    "agent_list",
    "worktree_list",
    "agent_created",
    "agent_deleted",
    "connection_code",
];

/// Errors from filesystem RPC.
#[derive(Debug, Clone)]
pub enum FsError {
    /// The peer did not answer in time.
    Timeout,
    /// The peer answered `{ok: false}`.
    Rejected(String),
    /// The connection went away before the response.
    ConnectionClosed,
    /// The request could not be sent.
    SendFailed,
}

impl std::fmt::Display for FsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "fs request timed out"),
            Self::Rejected(reason) => write!(f, "fs request rejected: {reason}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::SendFailed => write!(f, "fs request could not be sent"),
        }
    }
}

impl std::error::Error for FsError {}

/// Pending filesystem RPCs keyed by request id.
pub(crate) struct HubState {
    pending: HashMap<String, oneshot::Sender<Result<Value, FsError>>>,
}

impl HubState {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

/// Route a hub payload.
pub(crate) async fn handle_payload(conn: &Connection, payload: Payload) {
    let value = match payload {
        Payload::Json(value) => value,
        Payload::Text(text) => {
            conn.emit(ConnectionEvent::Message(Value::String(text)));
            return;
        }
        other => {
            log::debug!("Unexpected non-JSON payload on hub channel: {other:?}");
            return;
        }
    };

    let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

    if ROUTED_EVENTS.contains(&msg_type) {
        conn.emit(ConnectionEvent::Event {
            name: msg_type.to_string(),
            data: value,
        });
        return;
    }

    // Response correlation: anything carrying a request id resolves its
    // pending RPC.
    if let Some(request_id) = value.get("request_id").and_then(|id| id.as_str()) {
        let waiter = {
            let mut variant = conn.variant().lock().await;
            match &mut *variant {
                VariantState::Hub(state) => state.pending.remove(request_id),
                _ => None,
            }
        };
        if let Some(waiter) = waiter {
            let result = if value.get("ok").and_then(|ok| ok.as_bool()).unwrap_or(false) {
                Ok(value)
            } else {
                let reason = value
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown error")
                    .to_string();
                Err(FsError::Rejected(reason))
            };
            let _ = waiter.send(result);
            return;
        }
        log::debug!("Response for expired request {request_id}, discarding");
        return;
    }

    conn.emit(ConnectionEvent::Message(value));
}

/// The hub control channel.
#[derive(Debug)]
pub struct HubConnection {
    conn: Arc<Connection>,
}

impl HubConnection {
    /// Create a hub connection.
    pub fn new(
        bridge: Arc<TransportBridge>,
        hub_id: impl Into<String>,
        cable_url: impl Into<String>,
    ) -> Self {
        Self {
            conn: Connection::new(bridge, hub_id, cable_url, ChannelSpec::hub()),
        }
    }

    /// Wrap an existing core connection; must be a hub channel.
    pub fn from_core(conn: Arc<Connection>) -> Option<Self> {
        (conn.kind() == ChannelKind::Hub).then_some(Self { conn })
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

    /// Send a control message.
    pub async fn send(&self, msg_type: &str, data: Value) -> bool {
        self.conn.send(msg_type, data).await
    }

    /// Filesystem RPC: send `{type, params, request_id}` and await the
    /// correlated `{ok, ...}` response.
    pub async fn fs_request(
        &self,
        request_type: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, FsError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut variant = self.conn.variant().lock().await;
            match &mut *variant {
                VariantState::Hub(state) => {
                    state.pending.insert(request_id.clone(), tx);
                }
                _ => return Err(FsError::ConnectionClosed),
            }
        }

        let sent = self
            .conn
            .send(
                request_type,
                json!({ "params": params, "request_id": request_id }),
            )
            .await;

        if !sent {
            self.evict(&request_id).await;
            return Err(FsError::SendFailed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FsError::ConnectionClosed),
            Err(_) => {
                // Evict so a late response is discarded, not misdelivered.
                self.evict(&request_id).await;
                Err(FsError::Timeout)
            }
        }
    }

    async fn evict(&self, request_id: &str) {
        let mut variant = self.conn.variant().lock().await;
        if let VariantState::Hub(state) = &mut *variant {
            state.pending.remove(request_id);
        }
    }
}
