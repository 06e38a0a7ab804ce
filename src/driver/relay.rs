//! Relay driver.
//!
//! Rides an existing subscription-oriented signaling relay. The relay
//! guarantees FIFO, at-least-once delivery of opaque payloads and handles
//! its own heartbeats and reconnection; this driver maps subscriptions 1:1
//! onto relay subscription tokens and translates relay callbacks into
//! [`DriverEvent`]s.
//!
//! Everything the relay carries for us is a JSON envelope - it never sees
//! plaintext, and binary frames are a peer-channel-only concept.

// Rust guideline compliant 2026-02

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{ChannelDriver, DriverError, DriverEvent, LinkState, TransportError, WireFrame};

/// Capacity of the driver event bus.
const EVENT_CAPACITY: usize = 256;

/// A subscription request handed to the relay.
#[derive(Debug, Clone)]
pub struct SubscribeSpec {
    /// Channel identifier (e.g. "hub", "terminal", "preview").
    pub channel: String,
    /// Hub the subscription belongs to.
    pub hub_id: String,
    /// Channel-specific parameters, serialized into the relay identifier.
    pub params: serde_json::Value,
}

/// Events raised by the relay collaborator.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The relay connection changed state.
    StateChanged(LinkState),
    /// A subscription was confirmed by the far side.
    Confirmed {
        /// The confirmed subscription token.
        token: String,
    },
    /// A subscription was rejected.
    Rejected {
        /// The rejected subscription token.
        token: String,
        /// Rejection reason.
        reason: String,
    },
    /// A payload arrived on a subscription.
    Received {
        /// The subscription the payload arrived on.
        token: String,
        /// The payload, opaque to the relay.
        payload: serde_json::Value,
    },
    /// A single subscription was torn down by the far side.
    Disconnected {
        /// The subscription that went away.
        token: String,
    },
}

/// The signaling relay, as this core needs it.
///
/// Contract: reliable FIFO per subscription, at-least-once delivery,
/// payloads treated as opaque. Reconnection and heartbeats are the relay
/// library's job.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Establish (or join) the relay session.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Tear the relay session down.
    async fn disconnect(&self);

    /// Request a subscription. Returns a token immediately; confirmation
    /// arrives as a [`TransportEvent::Confirmed`].
    async fn subscribe(&self, spec: SubscribeSpec) -> Result<String, TransportError>;

    /// Drop a subscription.
    async fn unsubscribe(&self, token: &str);

    /// Fire-and-forget a named action with a payload on a subscription.
    async fn perform(
        &self,
        token: &str,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<(), TransportError>;

    /// Subscribe to relay events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Driver adapting a [`SignalingTransport`] to the bridge.
pub struct RelayDriver {
    transport: Arc<dyn SignalingTransport>,
    subscribe_timeout: Duration,
    hubs: StdMutex<HashSet<String>>,
    subs: StdMutex<HashSet<String>>,
    events_tx: broadcast::Sender<DriverEvent>,
    pump: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayDriver")
            .field("hubs", &self.hubs.lock().expect("hubs lock poisoned").len())
            .finish_non_exhaustive()
    }
}

impl RelayDriver {
    /// Create a driver over a relay transport.
    pub fn new(transport: Arc<dyn SignalingTransport>, subscribe_timeout: Duration) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let driver = Arc::new(Self {
            transport,
            subscribe_timeout,
            hubs: StdMutex::new(HashSet::new()),
            subs: StdMutex::new(HashSet::new()),
            events_tx,
            pump: StdMutex::new(None),
        });

        // The pump holds a Weak so dropping the last external Arc stops it.
        let weak = Arc::downgrade(&driver);
        let mut rx = driver.transport.events();
        let pump = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Relay event pump lagged, dropped {n} events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(driver) = weak.upgrade() else { break };
                driver.handle_transport_event(event);
            }
        });
        *driver.pump.lock().expect("pump lock poisoned") = Some(pump);
        driver
    }

    /// Translate one relay event into driver events.
    fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => {
                let hubs: Vec<String> = self
                    .hubs
                    .lock()
                    .expect("hubs lock poisoned")
                    .iter()
                    .cloned()
                    .collect();
                for hub_id in hubs {
                    let _ = self
                        .events_tx
                        .send(DriverEvent::ConnectionState { hub_id, state });
                }
            }
            TransportEvent::Confirmed { token } => {
                let _ = self.events_tx.send(DriverEvent::SubscriptionConfirmed {
                    subscription_id: token,
                });
            }
            TransportEvent::Rejected { token, reason } => {
                let _ = self.events_tx.send(DriverEvent::SubscriptionRejected {
                    subscription_id: token,
                    reason,
                });
            }
            TransportEvent::Received { token, payload } => {
                let _ = self.events_tx.send(DriverEvent::Message {
                    subscription_id: token,
                    frame: WireFrame::Json(payload),
                });
            }
            TransportEvent::Disconnected { token } => {
                log::debug!("Relay dropped subscription {token}");
                self.subs.lock().expect("subs lock poisoned").remove(&token);
            }
        }
    }
}

#[async_trait]
impl ChannelDriver for RelayDriver {
    async fn connect(&self, hub_id: &str, cable_url: &str) -> Result<(), DriverError> {
        self.transport
            .connect(cable_url)
            .await
            .map_err(|e| DriverError::SendFailed(e.to_string()))?;

        self.hubs
            .lock()
            .expect("hubs lock poisoned")
            .insert(hub_id.to_string());

        let _ = self.events_tx.send(DriverEvent::ConnectionState {
            hub_id: hub_id.to_string(),
            state: LinkState::Connected,
        });
        Ok(())
    }

    async fn disconnect(&self, hub_id: &str) {
        let now_empty = {
            let mut hubs = self.hubs.lock().expect("hubs lock poisoned");
            hubs.remove(hub_id);
            hubs.is_empty()
        };

        let _ = self.events_tx.send(DriverEvent::ConnectionState {
            hub_id: hub_id.to_string(),
            state: LinkState::Disconnected,
        });

        // The relay session is shared across hubs; close it only when the
        // last one detaches.
        if now_empty {
            self.transport.disconnect().await;
        }
    }

    async fn subscribe(
        &self,
        hub_id: &str,
        channel: &str,
        params: serde_json::Value,
    ) -> Result<String, DriverError> {
        // Listen before subscribing: the confirmation can beat us to it.
        let mut rx = self.events_tx.subscribe();

        let token = self
            .transport
            .subscribe(SubscribeSpec {
                channel: channel.to_string(),
                hub_id: hub_id.to_string(),
                params,
            })
            .await
            .map_err(|e| DriverError::SendFailed(e.to_string()))?;

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(DriverEvent::SubscriptionConfirmed { subscription_id })
                        if subscription_id == token =>
                    {
                        return Ok(());
                    }
                    Ok(DriverEvent::SubscriptionRejected {
                        subscription_id,
                        reason,
                    }) if subscription_id == token => {
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
                    .insert(token.clone());
                Ok(token)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Release the half-open subscription so a retry starts clean.
                self.transport.unsubscribe(&token).await;
                Err(DriverError::Timeout("subscribe"))
            }
        }
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        self.subs
            .lock()
            .expect("subs lock poisoned")
            .remove(subscription_id);
        self.transport.unsubscribe(subscription_id).await;
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
            WireFrame::Json(payload) => self
                .transport
                .perform(subscription_id, "message", payload)
                .await
                .map_err(|e| DriverError::SendFailed(e.to_string())),
            WireFrame::Binary(_) => Err(DriverError::SendFailed(
                "relay transport carries JSON envelopes only".to_string(),
            )),
        }
    }

    fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events_tx.subscribe()
    }
}

impl Drop for RelayDriver {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().expect("pump lock poisoned").take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod test_transport {
    //! An in-memory relay for driver and bridge tests: auto-confirms
    //! subscriptions and hands sent payloads to a test-controlled sink.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory [`SignalingTransport`].
    pub struct LoopbackRelay {
        events_tx: broadcast::Sender<TransportEvent>,
        next_token: AtomicU64,
        /// Payloads sent via `perform`, keyed by token.
        pub sent: StdMutex<Vec<(String, serde_json::Value)>>,
        /// Tokens by "{channel}:{hub_id}" for test-side injection.
        pub tokens: StdMutex<HashMap<String, String>>,
        /// When true, subscriptions are rejected instead of confirmed.
        pub reject_subscriptions: StdMutex<bool>,
        /// When true, confirmations are never sent (timeout path).
        pub swallow_confirmations: StdMutex<bool>,
    }

    impl LoopbackRelay {
        pub fn new() -> Arc<Self> {
            let (events_tx, _) = broadcast::channel(256);
            Arc::new(Self {
                events_tx,
                next_token: AtomicU64::new(1),
                sent: StdMutex::new(Vec::new()),
                tokens: StdMutex::new(HashMap::new()),
                reject_subscriptions: StdMutex::new(false),
                swallow_confirmations: StdMutex::new(false),
            })
        }

        /// Inject an inbound payload on a subscription.
        pub fn inject(&self, token: &str, payload: serde_json::Value) {
            let _ = self.events_tx.send(TransportEvent::Received {
                token: token.to_string(),
                payload,
            });
        }

        /// Token for a "{channel}:{hub_id}" pair, if subscribed.
        pub fn token_for(&self, channel: &str, hub_id: &str) -> Option<String> {
            self.tokens
                .lock()
                .expect("tokens lock poisoned")
                .get(&format!("{channel}:{hub_id}"))
                .cloned()
        }

        /// Emit a relay connection state change.
        pub fn set_state(&self, state: LinkState) {
            let _ = self.events_tx.send(TransportEvent::StateChanged(state));
        }
    }

    #[async_trait]
    impl SignalingTransport for LoopbackRelay {
        async fn connect(&self, _url: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn subscribe(&self, spec: SubscribeSpec) -> Result<String, TransportError> {
            let token = format!("sub-{}", self.next_token.fetch_add(1, Ordering::SeqCst));
            self.tokens
                .lock()
                .expect("tokens lock poisoned")
                .insert(format!("{}:{}", spec.channel, spec.hub_id), token.clone());

            if *self.reject_subscriptions.lock().expect("lock poisoned") {
                let _ = self.events_tx.send(TransportEvent::Rejected {
                    token: token.clone(),
                    reason: "unauthorized".to_string(),
                });
            } else if !*self.swallow_confirmations.lock().expect("lock poisoned") {
                let _ = self.events_tx.send(TransportEvent::Confirmed {
                    token: token.clone(),
                });
            }
            Ok(token)
        }

        async fn unsubscribe(&self, _token: &str) {}

        async fn perform(
            &self,
            token: &str,
            _action: &str,
            payload: serde_json::Value,
        ) -> Result<(), TransportError> {
            self.sent
                .lock()
                .expect("sent lock poisoned")
                .push((token.to_string(), payload));
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events_tx.subscribe()
        }
    }
}
