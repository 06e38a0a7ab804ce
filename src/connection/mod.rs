//! Per-hub connection lifecycle.
//!
//! A [`Connection`] is one logical channel to one hub: it owns a
//! subscription on the bridge, tracks link and CLI health, gates sends on
//! the CLI-ready handshake, and recovers from restarts by transparently
//! resubscribing. Channel behavior that differs between hub control,
//! terminal, and preview lives in a [`ChannelSpec`] plus a `match` on
//! [`ChannelKind`] - one lifecycle, three payload dialects.
//!
//! # States
//!
//! ```text
//! DISCONNECTED ──initialize──► LOADING ──hub attached──► CONNECTING
//!      ▲                                                     │ subscribe
//!      │ destroy                                       confirmed
//!      │                                                     ▼
//!      └──────────────── CLI_DISCONNECTED ◄──cli lost── CONNECTED
//!                              │                             │
//!                              └────────cli back─────────────┘
//!
//! ERROR: session invalid / identity mismatch; refuses all sends.
//! ```

// Rust guideline compliant 2026-02

pub mod hub;
pub mod manager;
pub mod preview;
pub mod terminal;

pub use hub::HubConnection;
pub use manager::ConnectionManager;
pub use preview::PreviewConnection;
pub use terminal::TerminalConnection;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::bridge::{BridgeError, BridgeEvent, OutboundMessage, Payload, TransportBridge};
use crate::codec::stream::StreamFrame;
use crate::driver::LinkState;
use crate::engine::bundle::PairingBundle;

/// Capacity of a connection's event bus.
const EVENT_CAPACITY: usize = 256;

/// Lifecycle states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not initialized, or destroyed.
    Disconnected,
    /// Crypto bootstrap and hub attach in progress.
    Loading,
    /// Hub attached; subscription not yet confirmed.
    Connecting,
    /// Subscription live.
    Connected,
    /// Subscription live but the CLI process went away.
    CliDisconnected,
    /// Fatal: session invalid or subscription rejected; re-pair to recover.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Loading => "loading",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::CliDisconnected => "cli_disconnected",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Which channel dialect a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Control plane: agent lifecycle and filesystem RPC.
    Hub,
    /// Streaming PTY I/O with snapshot reassembly.
    Terminal,
    /// HTTP preview tunneling over multiplexed streams.
    Preview,
}

/// Per-channel specialization of the shared lifecycle.
///
/// Replaces subclass overrides with a record: name, params, and the two
/// behavior flags; payload dispatch is a `match` on [`ChannelKind`].
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    /// The channel dialect.
    pub kind: ChannelKind,
    /// Channel-specific subscription parameters.
    pub params: Value,
    /// Whether reliable-delivery framing is enabled.
    pub reliable: bool,
    /// Whether sends are buffered until the peer signals `input_ready`.
    pub requires_cli_ready: bool,
}

impl ChannelSpec {
    /// The hub control channel.
    pub fn hub() -> Self {
        Self {
            kind: ChannelKind::Hub,
            params: json!({}),
            reliable: false,
            requires_cli_ready: false,
        }
    }

    /// A terminal channel. Rows/cols ride along with the subscribe so the
    /// peer can size the PTY before delivering output.
    pub fn terminal(agent_index: usize, pty_index: usize, rows: u16, cols: u16) -> Self {
        Self {
            kind: ChannelKind::Terminal,
            params: json!({
                "agent_index": agent_index,
                "pty_index": pty_index,
                "rows": rows,
                "cols": cols,
            }),
            reliable: true,
            // Without the gate the first keystroke races the peer's own
            // subscription setup and gets lost.
            requires_cli_ready: true,
        }
    }

    /// A preview channel tunneling HTTP to a local port on the peer.
    pub fn preview(port: u16) -> Self {
        Self {
            kind: ChannelKind::Preview,
            params: json!({ "port": port }),
            reliable: false,
            requires_cli_ready: false,
        }
    }

    /// The wire name of the channel.
    pub fn channel_name(&self) -> &'static str {
        match self.kind {
            ChannelKind::Hub => "hub",
            ChannelKind::Terminal => "terminal",
            ChannelKind::Preview => "preview",
        }
    }
}

/// Events a connection raises toward its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The lifecycle state changed.
    StateChanged(ConnectionState),
    /// The subscription is live.
    Connected,
    /// The peer signalled `input_ready`; buffered sends were flushed.
    CliReady,
    /// Fatal error; `code` is machine-readable, `message` human-readable.
    Error {
        /// Machine-readable code (e.g. "session_invalid").
        code: String,
        /// Human-readable reason.
        message: String,
    },
    /// A JSON control message not otherwise routed.
    Message(Value),
    /// Terminal output bytes (live output or an assembled snapshot).
    Output(Vec<u8>),
    /// A named hub event (`agent_list`, `worktree_list`, ...).
    Event {
        /// Event name.
        name: String,
        /// The full message.
        data: Value,
    },
}

/// Errors from connection operations.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// The bridge refused the operation.
    Bridge(BridgeError),
    /// The connection is in the wrong state for the operation.
    InvalidState(&'static str),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bridge(e) => write!(f, "{e}"),
            Self::InvalidState(what) => write!(f, "invalid state: {what}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<BridgeError> for ConnectionError {
    fn from(e: BridgeError) -> Self {
        Self::Bridge(e)
    }
}

/// A send deferred until the CLI-ready handshake completes.
#[derive(Debug)]
enum BufferedSend {
    Json(Value),
    Terminal(Vec<u8>),
}

struct ConnInner {
    state: ConnectionState,
    error_code: Option<String>,
    error_message: Option<String>,
    subscription_id: Option<String>,
    hub_connected: bool,
    cli_ready: bool,
    input_buffer: VecDeque<BufferedSend>,
    /// Single-writer locks for subscribe/resubscribe.
    subscribing: bool,
    resubscribing: bool,
    /// Set once a subscription has been requested; drives auto-resubscribe
    /// after link flaps.
    want_subscription: bool,
    listener: Option<tokio::task::JoinHandle<()>>,
    initialized: bool,
}

/// Channel-specific mutable state.
pub(crate) enum VariantState {
    Hub(hub::HubState),
    Terminal(terminal::TerminalState),
    Preview(preview::PreviewState),
}

/// One logical channel to one hub.
pub struct Connection {
    bridge: Arc<TransportBridge>,
    hub_id: String,
    cable_url: String,
    spec: ChannelSpec,
    inner: StdMutex<ConnInner>,
    variant: tokio::sync::Mutex<VariantState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    weak_self: StdMutex<Weak<Connection>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hub_id", &&self.hub_id[..self.hub_id.len().min(8)])
            .field("channel", &self.spec.channel_name())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection. Nothing touches the wire until
    /// [`Self::initialize`].
    pub fn new(
        bridge: Arc<TransportBridge>,
        hub_id: impl Into<String>,
        cable_url: impl Into<String>,
        spec: ChannelSpec,
    ) -> Arc<Self> {
        let variant = match spec.kind {
            ChannelKind::Hub => VariantState::Hub(hub::HubState::new()),
            ChannelKind::Terminal => VariantState::Terminal(terminal::TerminalState::new()),
            ChannelKind::Preview => VariantState::Preview(preview::PreviewState::new()),
        };

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let conn = Arc::new(Self {
            bridge,
            hub_id: hub_id.into(),
            cable_url: cable_url.into(),
            spec,
            inner: StdMutex::new(ConnInner {
                state: ConnectionState::Disconnected,
                error_code: None,
                error_message: None,
                subscription_id: None,
                hub_connected: false,
                cli_ready: false,
                input_buffer: VecDeque::new(),
                subscribing: false,
                resubscribing: false,
                want_subscription: false,
                listener: None,
                initialized: false,
            }),
            variant: tokio::sync::Mutex::new(variant),
            events_tx,
            weak_self: StdMutex::new(Weak::new()),
        });
        *conn.weak_self.lock().expect("weak lock poisoned") = Arc::downgrade(&conn);
        conn
    }

    /// Subscribe to connection events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// The hub this connection belongs to.
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// The channel dialect.
    pub fn kind(&self) -> ChannelKind {
        self.spec.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().expect("inner lock poisoned").state
    }

    /// Current error code, if the connection is in [`ConnectionState::Error`].
    pub fn error_code(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("inner lock poisoned")
            .error_code
            .clone()
    }

    /// Human-readable error reason, if any ("Session expired - rescan the
    /// QR code" and friends).
    pub fn error_message(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("inner lock poisoned")
            .error_message
            .clone()
    }

    /// The current subscription id, if subscribed.
    pub fn subscription_id(&self) -> Option<String> {
        self.inner
            .lock()
            .expect("inner lock poisoned")
            .subscription_id
            .clone()
    }

    /// Whether the CLI-ready handshake has completed.
    pub fn cli_ready(&self) -> bool {
        self.inner.lock().expect("inner lock poisoned").cli_ready
    }

    pub(crate) fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    pub(crate) fn variant(&self) -> &tokio::sync::Mutex<VariantState> {
        &self.variant
    }

    fn set_state(&self, state: ConnectionState) {
        {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            if inner.state == state {
                return;
            }
            inner.state = state;
        }
        let _ = self.events_tx.send(ConnectionEvent::StateChanged(state));
    }

    fn set_error(&self, code: &str, message: &str) {
        {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            inner.state = ConnectionState::Error;
            inner.error_code = Some(code.to_string());
            inner.error_message = Some(message.to_string());
        }
        let _ = self
            .events_tx
            .send(ConnectionEvent::StateChanged(ConnectionState::Error));
        let _ = self.events_tx.send(ConnectionEvent::Error {
            code: code.to_string(),
            message: message.to_string(),
        });
    }

    /// Bootstrap: attach the hub (creating the crypto session if a bundle
    /// is supplied), start the event listener, and subscribe. Idempotent.
    pub async fn initialize(&self, bundle: Option<PairingBundle>) -> Result<(), ConnectionError> {
        {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            if inner.initialized && inner.state != ConnectionState::Disconnected {
                return Ok(());
            }
            inner.initialized = true;
        }
        self.set_state(ConnectionState::Loading);

        self.bridge
            .connect(&self.hub_id, &self.cable_url, bundle)
            .await?;

        {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            inner.hub_connected = true;
            if inner.listener.is_none() {
                inner.listener = Some(self.spawn_listener());
            }
        }
        self.set_state(ConnectionState::Connecting);

        self.subscribe(false).await
    }

    fn spawn_listener(&self) -> tokio::task::JoinHandle<()> {
        let weak = self.weak_self.lock().expect("weak lock poisoned").clone();
        let mut rx = self.bridge.events();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection listener lagged, dropped {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(conn) = weak.upgrade() else { break };
                conn.handle_bridge_event(event).await;
            }
        })
    }

    async fn handle_bridge_event(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::ConnectionState { hub_id, state } if hub_id == self.hub_id => {
                self.on_link_state(state).await;
            }
            BridgeEvent::SessionInvalid { hub_id, message } if hub_id == self.hub_id => {
                self.set_error("session_invalid", &message);
            }
            BridgeEvent::SessionRefreshed { hub_id } if hub_id == self.hub_id => {
                let _ = self.events_tx.send(ConnectionEvent::Event {
                    name: "session_refreshed".to_string(),
                    data: json!({ "hub_id": hub_id }),
                });
            }
            BridgeEvent::SubscriptionMessage {
                subscription_id,
                message,
            } if self.owns_subscription(&subscription_id) => {
                self.handle_payload(message).await;
            }
            BridgeEvent::SubscriptionStalled { subscription_id }
                if self.owns_subscription(&subscription_id) =>
            {
                log::warn!(
                    "Reliable delivery stalled on {} ({})",
                    subscription_id,
                    self.spec.channel_name()
                );
                {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    inner.subscription_id = None;
                    inner.cli_ready = false;
                }
                self.set_state(ConnectionState::Connecting);
            }
            BridgeEvent::StreamFrame {
                subscription_id,
                frame,
                ..
            } if self.owns_subscription(&subscription_id) => {
                self.handle_stream_frame(frame).await;
            }
            _ => {}
        }
    }

    fn owns_subscription(&self, subscription_id: &str) -> bool {
        self.inner
            .lock()
            .expect("inner lock poisoned")
            .subscription_id
            .as_deref()
            == Some(subscription_id)
    }

    async fn on_link_state(&self, state: LinkState) {
        match state {
            LinkState::Connected => {
                let resubscribe = {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    let was_down = !inner.hub_connected;
                    inner.hub_connected = true;
                    // A link flap invalidates the peer-side subscription;
                    // drop ours and fetch a fresh snapshot.
                    was_down && inner.want_subscription
                };
                if resubscribe {
                    {
                        let mut inner = self.inner.lock().expect("inner lock poisoned");
                        inner.subscription_id = None;
                        inner.cli_ready = false;
                    }
                    if let Err(e) = self.subscribe(false).await {
                        log::warn!("Auto-resubscribe failed: {e}");
                    }
                }
            }
            LinkState::Disconnected => {
                let was_connected = {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    inner.hub_connected = false;
                    inner.subscription_id = None;
                    inner.cli_ready = false;
                    matches!(
                        inner.state,
                        ConnectionState::Connected | ConnectionState::CliDisconnected
                    )
                };
                if was_connected {
                    self.set_state(ConnectionState::Connecting);
                }
            }
            LinkState::Connecting => {}
        }
    }

    /// Open (or reopen) the subscription.
    ///
    /// Resolves immediately when already subscribed and `force` is false.
    /// Under the `subscribing` single-writer lock: with `force` the old
    /// subscription is dropped first; the CLI-ready gate re-arms on every
    /// fresh subscription.
    pub async fn subscribe(&self, force: bool) -> Result<(), ConnectionError> {
        let old = {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            if inner.subscribing {
                return Ok(());
            }
            if inner.subscription_id.is_some() && !force {
                drop(inner);
                self.set_state(ConnectionState::Connected);
                let _ = self.events_tx.send(ConnectionEvent::Connected);
                return Ok(());
            }
            inner.subscribing = true;
            inner.cli_ready = false;
            inner.want_subscription = true;
            if force {
                inner.subscription_id.take()
            } else {
                None
            }
        };

        if let Some(old) = old {
            self.bridge.unsubscribe(&old).await;
        }

        let result = self
            .bridge
            .subscribe(
                &self.hub_id,
                self.spec.channel_name(),
                self.spec.params.clone(),
                self.spec.reliable,
            )
            .await;

        match result {
            Ok(subscription_id) => {
                {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    inner.subscription_id = Some(subscription_id);
                    inner.subscribing = false;
                }
                self.set_state(ConnectionState::Connected);
                let _ = self.events_tx.send(ConnectionEvent::Connected);

                if self.spec.requires_cli_ready {
                    self.send_handshake().await;
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    inner.subscribing = false;
                }
                match &e {
                    BridgeError::SubscriptionRejected(reason) => {
                        self.set_error("subscription_rejected", reason);
                    }
                    // Timeouts leave the connection in CONNECTING; the
                    // caller may retry.
                    _ => self.set_state(ConnectionState::Connecting),
                }
                Err(e.into())
            }
        }
    }

    /// Announce ourselves so the peer completes its side and replies
    /// `input_ready`. Bypasses the CLI-ready gate by construction.
    async fn send_handshake(&self) {
        let Some(subscription_id) = self.subscription_id() else {
            return;
        };
        let message = json!({ "type": "connected" });
        if let Err(e) = self
            .bridge
            .send(&subscription_id, OutboundMessage::Json(message))
            .await
        {
            log::warn!("Handshake send failed: {e}");
        }
    }

    /// Tear down the subscription but stay attached to the hub.
    pub async fn unsubscribe(&self) {
        let old = {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            if inner.subscribing {
                return;
            }
            inner.subscribing = true;
            inner.want_subscription = false;
            inner.cli_ready = false;
            inner.subscription_id.take()
        };

        if let Some(old) = old {
            self.bridge.unsubscribe(&old).await;
        }

        {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            inner.subscribing = false;
        }
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Synchronously clear all state; the wire teardown is fire-and-forget.
    /// Further `send`s return false.
    pub fn destroy(&self) {
        let (subscription_id, listener) = {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            inner.state = ConnectionState::Disconnected;
            inner.cli_ready = false;
            inner.want_subscription = false;
            inner.subscribing = false;
            inner.resubscribing = false;
            inner.initialized = false;
            inner.input_buffer.clear();
            (inner.subscription_id.take(), inner.listener.take())
        };

        if let Some(listener) = listener {
            listener.abort();
        }

        let bridge = Arc::clone(&self.bridge);
        let hub_id = self.hub_id.clone();
        tokio::spawn(async move {
            if let Some(subscription_id) = subscription_id {
                bridge.unsubscribe(&subscription_id).await;
            }
            bridge.disconnect(&hub_id).await;
        });

        let _ = self
            .events_tx
            .send(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
    }

    /// Send a typed JSON message.
    ///
    /// Returns false with no subscription or in ERROR; returns true after
    /// buffering when the CLI-ready gate is closed.
    pub async fn send(&self, msg_type: &str, data: Value) -> bool {
        let message = build_message(msg_type, data);
        match self.gate_outbound(|| BufferedSend::Json(message.clone())) {
            Gate::Refused => false,
            Gate::Buffered => true,
            Gate::Pass(subscription_id) => {
                self.send_with_retry(&subscription_id, OutboundMessage::Json(message))
                    .await
            }
        }
    }

    /// Send raw terminal input bytes, honoring the CLI-ready gate.
    pub async fn send_input(&self, bytes: &[u8]) -> bool {
        match self.gate_outbound(|| BufferedSend::Terminal(bytes.to_vec())) {
            Gate::Refused => false,
            Gate::Buffered => true,
            Gate::Pass(subscription_id) => {
                self.send_with_retry(
                    &subscription_id,
                    OutboundMessage::Terminal(bytes.to_vec()),
                )
                .await
            }
        }
    }

    /// Send a preview stream frame (never gated).
    pub(crate) async fn send_stream(&self, frame: StreamFrame) -> bool {
        let Some(subscription_id) = self.subscription_id() else {
            return false;
        };
        self.send_with_retry(&subscription_id, OutboundMessage::Stream(frame))
            .await
    }

    fn gate_outbound(&self, buffered: impl FnOnce() -> BufferedSend) -> Gate {
        let mut inner = self.inner.lock().expect("inner lock poisoned");
        if inner.state == ConnectionState::Error {
            return Gate::Refused;
        }
        let Some(subscription_id) = inner.subscription_id.clone() else {
            return Gate::Refused;
        };
        if self.spec.requires_cli_ready && !inner.cli_ready {
            inner.input_buffer.push_back(buffered());
            return Gate::Buffered;
        }
        Gate::Pass(subscription_id)
    }

    /// Send, transparently resubscribing once when the bridge reports the
    /// subscription id stale (crypto worker restart invalidates ids).
    async fn send_with_retry(&self, subscription_id: &str, message: OutboundMessage) -> bool {
        match self.bridge.send(subscription_id, message.clone()).await {
            Ok(_) => true,
            Err(BridgeError::NotFound) => {
                let may_retry = {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    if inner.resubscribing {
                        false
                    } else {
                        inner.resubscribing = true;
                        inner.subscription_id = None;
                        true
                    }
                };
                if !may_retry {
                    return false;
                }

                log::info!(
                    "Stale subscription on {}, resubscribing",
                    self.spec.channel_name()
                );
                let resubscribed = self.subscribe(false).await.is_ok();
                {
                    let mut inner = self.inner.lock().expect("inner lock poisoned");
                    inner.resubscribing = false;
                }
                if !resubscribed {
                    return false;
                }

                match self.subscription_id() {
                    Some(fresh) => self.bridge.send(&fresh, message).await.is_ok(),
                    None => false,
                }
            }
            Err(e) => {
                log::warn!("Send failed on {}: {e}", self.spec.channel_name());
                false
            }
        }
    }

    // ========== Inbound dispatch ==========

    async fn handle_payload(&self, payload: Payload) {
        // Lifecycle control frames are shared across channel kinds.
        if let Payload::Json(value) = &payload {
            match value.get("type").and_then(|t| t.as_str()) {
                Some("input_ready") => {
                    self.on_input_ready().await;
                    return;
                }
                Some("cli_disconnected") => {
                    {
                        let mut inner = self.inner.lock().expect("inner lock poisoned");
                        inner.cli_ready = false;
                    }
                    if self.state() == ConnectionState::Connected {
                        self.set_state(ConnectionState::CliDisconnected);
                    }
                    return;
                }
                Some("cli_connected") => {
                    if self.state() == ConnectionState::CliDisconnected {
                        self.set_state(ConnectionState::Connected);
                    }
                    if self.spec.requires_cli_ready && self.subscription_id().is_some() {
                        self.send_handshake().await;
                    }
                    return;
                }
                _ => {}
            }
        }

        match self.spec.kind {
            ChannelKind::Hub => hub::handle_payload(self, payload).await,
            ChannelKind::Terminal => terminal::handle_payload(self, payload).await,
            ChannelKind::Preview => preview::handle_payload(self, payload).await,
        }
    }

    async fn handle_stream_frame(&self, frame: StreamFrame) {
        if self.spec.kind == ChannelKind::Preview {
            preview::handle_stream_frame(self, frame).await;
        }
    }

    /// `input_ready` arrived: open the gate and flush the buffer in FIFO
    /// order.
    async fn on_input_ready(&self) {
        let drained: Vec<BufferedSend> = {
            let mut inner = self.inner.lock().expect("inner lock poisoned");
            inner.cli_ready = true;
            inner.input_buffer.drain(..).collect()
        };

        if !drained.is_empty() {
            log::debug!(
                "CLI ready on {}, flushing {} buffered sends",
                self.spec.channel_name(),
                drained.len()
            );
        }

        for item in drained {
            let Some(subscription_id) = self.subscription_id() else {
                break;
            };
            let message = match item {
                BufferedSend::Json(value) => OutboundMessage::Json(value),
                BufferedSend::Terminal(bytes) => OutboundMessage::Terminal(bytes),
            };
            if !self.send_with_retry(&subscription_id, message).await {
                log::warn!("Buffered send failed after input_ready");
            }
        }

        let _ = self.events_tx.send(ConnectionEvent::CliReady);
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }
}

enum Gate {
    Refused,
    Buffered,
    Pass(String),
}

/// Build `{"type": <msg_type>, ...data}`, tucking non-object data under a
/// `"data"` key.
fn build_message(msg_type: &str, data: Value) -> Value {
    match data {
        Value::Object(mut map) => {
            map.insert("type".to_string(), Value::String(msg_type.to_string()));
            Value::Object(map)
        }
        Value::Null => json!({ "type": msg_type }),
        other => json!({ "type": msg_type, "data": other }),
    }
}
