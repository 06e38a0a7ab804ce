//! Typed bridge events.
//!
//! The bridge fans events out on a broadcast channel; every observer
//! filters at the type level instead of matching string keys. One sender,
//! many receivers.

use crate::codec::snapshot::SnapshotChunk;
use crate::codec::stream::StreamFrame;
use crate::driver::LinkState;

/// A decrypted, decompressed, in-order payload delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A parsed JSON message (the common case for control traffic).
    Json(serde_json::Value),
    /// Raw terminal output bytes.
    Output(Vec<u8>),
    /// One chunk of a terminal snapshot.
    Snapshot(SnapshotChunk),
    /// Plaintext that was not valid JSON (legacy peers).
    Text(String),
}

/// Events raised by the [`crate::bridge::TransportBridge`].
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A hub's underlying link changed state.
    ConnectionState {
        /// The hub.
        hub_id: String,
        /// New state.
        state: LinkState,
    },
    /// The auxiliary signaling path changed state.
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
    /// An in-order application payload arrived on a subscription.
    SubscriptionMessage {
        /// The subscription the payload arrived on.
        subscription_id: String,
        /// The payload.
        message: Payload,
    },
    /// Reliable delivery on the subscription exhausted its retransmit
    /// attempts; the peer is unreachable.
    SubscriptionStalled {
        /// The stalled subscription.
        subscription_id: String,
    },
    /// Decrypt failures crossed the threshold, or the peer signalled
    /// session loss. The hub needs re-pairing (or a bundle refresh).
    SessionInvalid {
        /// The affected hub.
        hub_id: String,
        /// Human-readable cause.
        message: String,
    },
    /// A session was successfully re-created from a fresh bundle.
    SessionRefreshed {
        /// The affected hub.
        hub_id: String,
    },
    /// A preview stream-multiplexer frame arrived.
    StreamFrame {
        /// The hub the frame belongs to.
        hub_id: String,
        /// The subscription the frame arrived on.
        subscription_id: String,
        /// The frame.
        frame: StreamFrame,
    },
    /// An opaque peer-health snapshot.
    Health {
        /// The hub the report describes.
        hub_id: String,
        /// The report, passed through untouched.
        report: serde_json::Value,
    },
}
