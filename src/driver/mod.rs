//! Underlying channel drivers.
//!
//! The bridge delegates wire I/O to a [`ChannelDriver`]. Two drivers exist:
//!
//! - [`relay::RelayDriver`] - rides an existing subscription-oriented
//!   signaling relay; frames are JSON envelopes.
//! - [`peer::PeerDriver`] - rides a direct peer data channel; frames are
//!   binary, multiplexed across subscriptions with a short header.
//!
//! Both are adapters over collaborator traits the embedder supplies
//! ([`relay::SignalingTransport`], [`peer::PeerChannel`]); the core never
//! talks to a socket itself.

// Rust guideline compliant 2026-02

pub mod peer;
pub mod relay;

use async_trait::async_trait;
use tokio::sync::broadcast;

/// Health of a hub's underlying link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link establishment in progress.
    Connecting,
    /// Link alive.
    Connected,
    /// Link down.
    Disconnected,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A frame crossing the driver boundary.
#[derive(Debug, Clone)]
pub enum WireFrame {
    /// JSON payload (envelopes on the relay, wrapped messages on the peer
    /// channel).
    Json(serde_json::Value),
    /// Raw binary payload (peer data channel only).
    Binary(Vec<u8>),
}

/// Events a driver raises toward the bridge.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A hub's link changed state.
    ConnectionState {
        /// The hub.
        hub_id: String,
        /// New state.
        state: LinkState,
    },
    /// The auxiliary signaling path changed state (peer transport only).
    SignalingState {
        /// The hub.
        hub_id: String,
        /// New state.
        state: LinkState,
    },
    /// The peer confirmed a subscription.
    SubscriptionConfirmed {
        /// The confirmed subscription.
        subscription_id: String,
    },
    /// The peer rejected a subscription.
    SubscriptionRejected {
        /// The rejected subscription.
        subscription_id: String,
        /// Peer-supplied reason.
        reason: String,
    },
    /// An inbound frame for a subscription.
    Message {
        /// The subscription the frame belongs to.
        subscription_id: String,
        /// The frame, still ciphertext at this layer.
        frame: WireFrame,
    },
}

/// Errors from driver operations.
#[derive(Debug, Clone)]
pub enum DriverError {
    /// The hub has no live link.
    NotConnected,
    /// The peer rejected the subscription.
    SubscriptionRejected(String),
    /// A request/response exchange timed out.
    Timeout(&'static str),
    /// The subscription id is unknown (stale after a restart).
    NotFound,
    /// The underlying transport failed to send.
    SendFailed(String),
    /// The underlying channel is closed.
    ChannelClosed,
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::SubscriptionRejected(reason) => write!(f, "subscription rejected: {reason}"),
            Self::Timeout(action) => write!(f, "timeout: {action}"),
            Self::NotFound => write!(f, "subscription not found"),
            Self::SendFailed(msg) => write!(f, "send failed: {msg}"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for DriverError {}

/// A transport driver the bridge can route subscriptions over.
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Attach a hub to the wire.
    async fn connect(&self, hub_id: &str, cable_url: &str) -> Result<(), DriverError>;

    /// Detach a hub from the wire.
    async fn disconnect(&self, hub_id: &str);

    /// Open a subscription. Resolves once the peer confirms it; rejects on
    /// peer refusal or the confirm timeout.
    async fn subscribe(
        &self,
        hub_id: &str,
        channel: &str,
        params: serde_json::Value,
    ) -> Result<String, DriverError>;

    /// Tear down a subscription.
    async fn unsubscribe(&self, subscription_id: &str);

    /// Write a frame to the wire.
    async fn send_raw(&self, subscription_id: &str, frame: WireFrame) -> Result<(), DriverError>;

    /// Subscribe to driver events.
    fn events(&self) -> broadcast::Receiver<DriverEvent>;
}

/// Error type shared by the collaborator traits the embedder implements.
#[derive(Debug, Clone)]
pub struct TransportError(pub String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}", self.0)
    }
}

impl std::error::Error for TransportError {}
