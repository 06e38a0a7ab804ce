//! Botster Link - client-side E2E encrypted transport core.
//!
//! This crate is the browser/client half of the Botster remote terminal
//! protocol: it consumes a pairing bundle (scanned out-of-band as a QR
//! fragment), establishes a long-lived Olm session with a peer CLI, and
//! carries hub control, terminal PTY I/O, and HTTP preview tunnels over
//! either a signaling relay or a direct peer data channel. The relay only
//! ever sees ciphertext.
//!
//! # Architecture
//!
//! ```text
//! HubConnection / TerminalConnection / PreviewConnection
//!         │
//!         ▼
//!     Connection (per-hub per-channel state machine)
//!         │
//!         ▼
//!     TransportBridge ──── CryptoService (Olm account/session, pickled store)
//!         │
//!         ▼
//!     ChannelDriver (RelayDriver | PeerDriver)
//!         │
//!         ▼
//!     SignalingTransport / PeerChannel (collaborators, supplied by embedder)
//! ```
//!
//! Outbound: a typed connection builds a message, the bridge frames it for
//! reliable delivery, the crypto service ratchet-encrypts it, and the driver
//! writes ciphertext to the wire. Inbound runs the same pipeline in reverse,
//! with in-order delivery guaranteed on reliable subscriptions.
//!
//! # Modules
//!
//! - [`codec`] - reliable-delivery frames, snapshot chunks, stream frames
//! - [`compression`] - marker-byte gzip framing for payloads
//! - [`reliable`] - sliding-window retransmission and ordered delivery
//! - [`engine`] - Olm accounts/sessions and the encrypted pickle store
//! - [`bridge`] - the cross-connection mediator and its event bus
//! - [`driver`] - underlying channel drivers (relay, peer)
//! - [`connection`] - the per-hub lifecycle and the typed channel variants
//! - [`config`] - transport options and protocol constants

// Rust guideline compliant 2026-02

pub mod bridge;
pub mod codec;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod driver;
pub mod engine;
pub mod reliable;

pub use bridge::{BridgeError, BridgeEvent, Payload, SendReceipt, TransportBridge};
pub use config::{ReliableConfig, TransportKind, TransportOptions};
pub use connection::{
    ChannelKind, ChannelSpec, Connection, ConnectionEvent, ConnectionManager, ConnectionState,
    HubConnection, PreviewConnection, TerminalConnection,
};
pub use engine::{
    bundle::PairingBundle,
    service::{CryptoService, CryptoServiceHandle},
    CryptoError, OlmEngine, OlmEnvelope,
};
