//! Peer driver.
//!
//! Rides a direct data channel to the peer CLI. Out-of-band signaling
//! (SDP offers, ICE candidates) is ferried through the relay by the
//! embedder; by the time this driver sees the channel it is already open
//! or about to open, and subscribe/unsubscribe/send all happen on it.
//!
//! # Multiplexing
//!
//! One data channel carries every subscription:
//!
//! - Binary frames get a routing header: `[sub_id_len:u8][sub_id][frame...]`
//! - JSON messages are wrapped as `{"subscription_id": ..., "data": ...}`
//!
//! The subscribe handshake is a JSON control exchange
//! (`{type:"subscribe"}` / `{type:"subscribed"|"rejected"}`) with the same
//! confirm timeout the relay path uses.

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

use super::{ChannelDriver, DriverError, DriverEvent, LinkState, TransportError, WireFrame};

/// Capacity of the driver event bus.
const EVENT_CAPACITY: usize = 256;

/// Events raised by the peer data channel collaborator.
#[derive(Debug, Clone)]
pub enum PeerChannelEvent {
    /// The channel opened.
    Open,
    /// The channel closed.
    Closed,
    /// The channel errored.
    Error(String),
    /// A text message arrived.
    Text(String),
    /// A binary message arrived.
    Binary(Vec<u8>),
}

/// An ordered reliable data channel to the peer, `RTCDataChannel`-like.
///
/// The embedder negotiates it (SDP and ICE flow through the relay) and
/// hands it over; the core stays agnostic to those details.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Open the channel. Resolves once the channel is usable.
    async fn open(&self) -> Result<(), TransportError>;

    /// Close the channel.
    async fn close(&self);

    /// Send a text message.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Send a binary message.
    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribe to channel events.
    fn events(&self) -> broadcast::Receiver<PeerChannelEvent>;
}

/// Driver adapting a [`PeerChannel`] to the bridge.
///
/// One driver serves one hub - the channel it wraps was negotiated with
/// that hub's CLI.
pub struct PeerDriver {
    channel: Arc<dyn PeerChannel>,
    subscribe_timeout: Duration,
    hub_id: StdMutex<Option<String>>,
    subs: StdMutex<HashSet<String>>,
    next_sub: AtomicU64,
    events_tx: broadcast::Sender<DriverEvent>,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for PeerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerDriver")
            .field("subs", &self.subs.lock().expect("subs lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl PeerDriver {
    /// Create a driver over a negotiated peer channel.
    pub fn new(channel: Arc<dyn PeerChannel>, subscribe_timeout: Duration) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let driver = Arc::new(Self {
            channel,
            subscribe_timeout,
            hub_id: StdMutex::new(None),
            subs: StdMutex::new(HashSet::new()),
            next_sub: AtomicU64::new(1),
            events_tx,
            pump: StdMutex::new(None),
        });

        let weak = Arc::downgrade(&driver);
        let mut rx = driver.channel.events();
        let pump = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Peer event pump lagged, dropped {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(driver) = weak.upgrade() else { break };
                driver.handle_channel_event(event);
            }
        });
        *driver.pump.lock().expect("pump lock poisoned") = Some(pump);
        driver
    }

    fn current_hub(&self) -> Option<String> {
        self.hub_id.lock().expect("hub lock poisoned").clone()
    }

    fn handle_channel_event(&self, event: PeerChannelEvent) {
        match event {
            PeerChannelEvent::Open => {
                if let Some(hub_id) = self.current_hub() {
                    let _ = self.events_tx.send(DriverEvent::ConnectionState {
                        hub_id,
                        state: LinkState::Connected,
                    });
                }
            }
            PeerChannelEvent::Closed => {
                if let Some(hub_id) = self.current_hub() {
                    let _ = self.events_tx.send(DriverEvent::ConnectionState {
                        hub_id,
                        state: LinkState::Disconnected,
                    });
                }
            }
            PeerChannelEvent::Error(msg) => {
                log::warn!("Peer channel error: {msg}");
                if let Some(hub_id) = self.current_hub() {
                    let _ = self.events_tx.send(DriverEvent::ConnectionState {
                        hub_id,
                        state: LinkState::Disconnected,
                    });
                }
            }
            PeerChannelEvent::Text(text) => self.handle_text(&text),
            PeerChannelEvent::Binary(bytes) => self.handle_binary(bytes),
        }
    }

    /// Incoming JSON: `{"subscription_id": ..., "data": ...}`. Control
    /// replies (`subscribed`/`rejected`/`unsubscribed`) resolve handshakes;
    /// everything else is an application message.
    fn handle_text(&self, text: &str) {
        let parsed: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Unparseable peer text frame: {e}");
                return;
            }
        };

        let Some(subscription_id) = parsed["subscription_id"].as_str().map(String::from) else {
            log::warn!("Peer text frame missing subscription_id");
            return;
        };
        let data = parsed["data"].clone();

        match data["type"].as_str() {
            Some("subscribed") => {
                let _ = self
                    .events_tx
                    .send(DriverEvent::SubscriptionConfirmed { subscription_id });
            }
            Some("rejected") => {
                let reason = data["reason"].as_str().unwrap_or("rejected").to_string();
                let _ = self.events_tx.send(DriverEvent::SubscriptionRejected {
                    subscription_id,
                    reason,
                });
            }
            Some("unsubscribed") => {
                self.subs
                    .lock()
                    .expect("subs lock poisoned")
                    .remove(&subscription_id);
            }
            _ => {
                let _ = self.events_tx.send(DriverEvent::Message {
                    subscription_id,
                    frame: WireFrame::Json(data),
                });
            }
        }
    }

    /// Incoming binary: `[sub_id_len:u8][sub_id][frame...]`.
    fn handle_binary(&self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        let id_len = bytes[0] as usize;
        if bytes.len() < 1 + id_len {
            log::warn!("Peer binary frame shorter than its routing header");
            return;
        }
        let Ok(subscription_id) = std::str::from_utf8(&bytes[1..1 + id_len]) else {
            log::warn!("Peer binary frame has non-UTF-8 subscription id");
            return;
        };

        let _ = self.events_tx.send(DriverEvent::Message {
            subscription_id: subscription_id.to_string(),
            frame: WireFrame::Binary(bytes[1 + id_len..].to_vec()),
        });
    }

    async fn send_control(
        &self,
        subscription_id: &str,
        data: serde_json::Value,
    ) -> Result<(), DriverError> {
        let wrapped = json!({ "subscription_id": subscription_id, "data": data });
        self.channel
            .send_text(wrapped.to_string())
            .await
            .map_err(|e| DriverError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl ChannelDriver for PeerDriver {
    async fn connect(&self, hub_id: &str, _cable_url: &str) -> Result<(), DriverError> {
        {
            let mut hub = self.hub_id.lock().expect("hub lock poisoned");
            if let Some(existing) = hub.as_deref() {
                if existing != hub_id {
                    return Err(DriverError::SendFailed(format!(
                        "peer channel already bound to hub {existing}"
                    )));
                }
            }
            *hub = Some(hub_id.to_string());
        }

        self.channel
            .open()
            .await
            .map_err(|e| DriverError::SendFailed(e.to_string()))?;

        let _ = self.events_tx.send(DriverEvent::ConnectionState {
            hub_id: hub_id.to_string(),
            state: LinkState::Connected,
        });
        Ok(())
    }

    async fn disconnect(&self, hub_id: &str) {
        let _ = self.events_tx.send(DriverEvent::ConnectionState {
            hub_id: hub_id.to_string(),
            state: LinkState::Disconnected,
        });
        self.channel.close().await;
    }

    async fn subscribe(
        &self,
        hub_id: &str,
        channel: &str,
        params: serde_json::Value,
    ) -> Result<String, DriverError> {
        let subscription_id = format!(
            "{channel}:{hub_id}:{}",
            self.next_sub.fetch_add(1, Ordering::SeqCst)
        );

        let mut rx = self.events_tx.subscribe();

        self.send_control(
            &subscription_id,
            json!({ "type": "subscribe", "channel": channel, "params": params }),
        )
        .await?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(DriverEvent::SubscriptionConfirmed { subscription_id: id })
                        if id == subscription_id =>
                    {
                        return Ok(());
                    }
                    Ok(DriverEvent::SubscriptionRejected {
                        subscription_id: id,
                        reason,
                    }) if id == subscription_id => {
                        return Err(DriverError::SubscriptionRejected(reason));
                    }
                    Ok(_) => continue,
                    Err(_) => return Err(DriverError::ChannelClosed),
                }
            }
        };

        match tokio::time::timeout(self.subscribe_timeout, wait).await {
            Ok(Ok(())) => {
                self.subs
                    .lock()
                    .expect("subs lock poisoned")
                    .insert(subscription_id.clone());
                Ok(subscription_id)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                let _ = self
                    .send_control(&subscription_id, json!({ "type": "unsubscribe" }))
                    .await;
                Err(DriverError::Timeout("subscribe"))
            }
        }
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        self.subs
            .lock()
            .expect("subs lock poisoned")
            .remove(subscription_id);
        let _ = self
            .send_control(subscription_id, json!({ "type": "unsubscribe" }))
            .await;
    }

    async fn send_raw(&self, subscription_id: &str, frame: WireFrame) -> Result<(), DriverError> {
        if !self
            .subs
            .lock()
            .expect("subs lock poisoned")
            .contains(subscription_id)
        {
            return Err(DriverError::NotFound);
        }

        match frame {
            WireFrame::Json(data) => self.send_control(subscription_id, data).await,
            WireFrame::Binary(bytes) => {
                let id_bytes = subscription_id.as_bytes();
                if id_bytes.len() > u8::MAX as usize {
                    return Err(DriverError::SendFailed("subscription id too long".into()));
                }
                let mut framed = Vec::with_capacity(1 + id_bytes.len() + bytes.len());
                framed.push(id_bytes.len() as u8);
                framed.extend_from_slice(id_bytes);
                framed.extend_from_slice(&bytes);
                self.channel
                    .send_binary(framed)
                    .await
                    .map_err(|e| DriverError::SendFailed(e.to_string()))
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events_tx.subscribe()
    }
}

impl Drop for PeerDriver {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().expect("pump lock poisoned").take() {
            pump.abort();
        }
    }
}
