//! Crypto Service - the engine behind a message-passing boundary.
//!
//! The engine is shared by every connection in the process (and, in the
//! original deployment, by every tab). Running it on a dedicated thread
//! with a request channel gives the same isolation a worker process would:
//! callers cannot block it, cannot reach pickle bytes, and all requests for
//! one hub funnel through the engine's per-hub FIFO mutex.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐        ┌─────────────────────────────────────┐
//! │ Transport    │        │       CRYPTO SERVICE THREAD         │
//! │ Bridge       │──req──▶│                                     │
//! │              │◀──res──│  current-thread runtime {           │
//! └──────────────┘        │    OlmEngine                        │
//!                         │    request loop + port heartbeat    │
//! ┌──────────────┐        │  }                                  │
//! │ other tab /  │──req──▶│                                     │
//! │ embedder     │◀──res──│                                     │
//! └──────────────┘        └─────────────────────────────────────┘
//! ```
//!
//! Every handle call carries a 10 second timeout; an expired request is
//! rejected with `timeout: <action>` and its late response discarded.
//! Attached ports are pinged every 5 seconds and reaped after 21 seconds
//! without a pong.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};

use super::bundle::PairingBundle;
use super::store::SessionStore;
use super::{CryptoError, OlmEngine, OlmEnvelope};

/// Per-request timeout at the handle boundary.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How often attached ports are pinged.
const PORT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// How long a port may go without a pong before it is reaped.
const PORT_STALE_AFTER: Duration = Duration::from_secs(21);

/// Requests handled by the crypto service.
///
/// Each variant carries a oneshot channel for the result; the reply side is
/// not Debug-printable so Debug is hand-written.
pub enum CryptoRequest {
    /// Create (or refresh) a session from a pairing bundle.
    CreateSession {
        /// Target hub.
        hub_id: String,
        /// The verified-on-arrival bundle.
        bundle: Box<PairingBundle>,
        /// Result: our identity key.
        reply: oneshot::Sender<Result<String, CryptoError>>,
    },
    /// Restore a hub from storage if needed; reports session availability.
    LoadSession {
        /// Target hub.
        hub_id: String,
        /// Result: whether a session exists.
        reply: oneshot::Sender<bool>,
    },
    /// Whether a session exists for the hub.
    HasSession {
        /// Target hub.
        hub_id: String,
        /// Result channel.
        reply: oneshot::Sender<bool>,
    },
    /// Encrypt into a JSON envelope.
    Encrypt {
        /// Target hub.
        hub_id: String,
        /// Plaintext to encrypt.
        plaintext: Vec<u8>,
        /// Result channel.
        reply: oneshot::Sender<Result<OlmEnvelope, CryptoError>>,
    },
    /// Decrypt a JSON envelope.
    Decrypt {
        /// Target hub.
        hub_id: String,
        /// Envelope to decrypt.
        envelope: Box<OlmEnvelope>,
        /// Result channel.
        reply: oneshot::Sender<Result<Vec<u8>, CryptoError>>,
    },
    /// Encrypt into a binary data-channel frame.
    EncryptBinary {
        /// Target hub.
        hub_id: String,
        /// Plaintext to encrypt.
        plaintext: Vec<u8>,
        /// Result channel.
        reply: oneshot::Sender<Result<Vec<u8>, CryptoError>>,
    },
    /// Decrypt a binary data-channel frame.
    DecryptBinary {
        /// Target hub.
        hub_id: String,
        /// Frame to decrypt.
        data: Vec<u8>,
        /// Result channel.
        reply: oneshot::Sender<Result<Vec<u8>, CryptoError>>,
    },
    /// Our Curve25519 identity key for the hub.
    IdentityKey {
        /// Target hub.
        hub_id: String,
        /// Result channel.
        reply: oneshot::Sender<Result<String, CryptoError>>,
    },
    /// Drop a hub's session and stored record.
    ClearSession {
        /// Target hub.
        hub_id: String,
        /// Completion channel.
        reply: oneshot::Sender<()>,
    },
    /// Drop every known hub.
    ClearAllSessions {
        /// Completion channel.
        reply: oneshot::Sender<()>,
    },
    /// Attach a port (one per tab/bridge) for liveness tracking.
    AttachPort {
        /// Pings are delivered here; the port answers with `Pong`.
        ping_tx: mpsc::UnboundedSender<()>,
        /// Result: the assigned port id.
        reply: oneshot::Sender<u64>,
    },
    /// A port's answer to a ping.
    Pong {
        /// The port answering.
        port_id: u64,
    },
    /// Stop the service.
    Shutdown,
}

impl std::fmt::Debug for CryptoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateSession { hub_id, .. } => f
                .debug_struct("CreateSession")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::LoadSession { hub_id, .. } => f
                .debug_struct("LoadSession")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::HasSession { hub_id, .. } => f
                .debug_struct("HasSession")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::Encrypt { hub_id, .. } => f
                .debug_struct("Encrypt")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::Decrypt { hub_id, envelope, .. } => f
                .debug_struct("Decrypt")
                .field("hub_id", &truncate(hub_id))
                .field("message_type", &envelope.message_type)
                .finish_non_exhaustive(),
            Self::EncryptBinary { hub_id, .. } => f
                .debug_struct("EncryptBinary")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::DecryptBinary { hub_id, .. } => f
                .debug_struct("DecryptBinary")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::IdentityKey { hub_id, .. } => f
                .debug_struct("IdentityKey")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::ClearSession { hub_id, .. } => f
                .debug_struct("ClearSession")
                .field("hub_id", &truncate(hub_id))
                .finish_non_exhaustive(),
            Self::ClearAllSessions { .. } => write!(f, "ClearAllSessions"),
            Self::AttachPort { .. } => write!(f, "AttachPort"),
            Self::Pong { port_id } => write!(f, "Pong({port_id})"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

fn truncate(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// Handle for sending requests to the crypto service.
///
/// Send + Sync, cheap to clone, shareable across every connection.
#[derive(Clone, Debug)]
pub struct CryptoServiceHandle {
    tx: mpsc::Sender<CryptoRequest>,
}

impl CryptoServiceHandle {
    async fn request<T>(
        &self,
        action: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> CryptoRequest,
    ) -> Result<T, CryptoError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| CryptoError::NotInitialized)?;

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CryptoError::NotInitialized),
            Err(_) => Err(CryptoError::WorkerTimeout(action)),
        }
    }

    /// Create (or refresh) a session from a pairing bundle.
    pub async fn create_session(
        &self,
        hub_id: &str,
        bundle: PairingBundle,
    ) -> Result<String, CryptoError> {
        self.request("create_session", |reply| CryptoRequest::CreateSession {
            hub_id: hub_id.to_string(),
            bundle: Box::new(bundle),
            reply,
        })
        .await?
    }

    /// Restore a hub from storage; reports whether a session exists.
    pub async fn load_session(&self, hub_id: &str) -> Result<bool, CryptoError> {
        self.request("load_session", |reply| CryptoRequest::LoadSession {
            hub_id: hub_id.to_string(),
            reply,
        })
        .await
    }

    /// Whether a session exists for the hub.
    pub async fn has_session(&self, hub_id: &str) -> Result<bool, CryptoError> {
        self.request("has_session", |reply| CryptoRequest::HasSession {
            hub_id: hub_id.to_string(),
            reply,
        })
        .await
    }

    /// Encrypt into a JSON envelope.
    pub async fn encrypt(
        &self,
        hub_id: &str,
        plaintext: &[u8],
    ) -> Result<OlmEnvelope, CryptoError> {
        self.request("encrypt", |reply| CryptoRequest::Encrypt {
            hub_id: hub_id.to_string(),
            plaintext: plaintext.to_vec(),
            reply,
        })
        .await?
    }

    /// Decrypt a JSON envelope.
    pub async fn decrypt(
        &self,
        hub_id: &str,
        envelope: &OlmEnvelope,
    ) -> Result<Vec<u8>, CryptoError> {
        self.request("decrypt", |reply| CryptoRequest::Decrypt {
            hub_id: hub_id.to_string(),
            envelope: Box::new(envelope.clone()),
            reply,
        })
        .await?
    }

    /// Encrypt into a binary data-channel frame.
    pub async fn encrypt_binary(
        &self,
        hub_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.request("encrypt_binary", |reply| CryptoRequest::EncryptBinary {
            hub_id: hub_id.to_string(),
            plaintext: plaintext.to_vec(),
            reply,
        })
        .await?
    }

    /// Decrypt a binary data-channel frame.
    pub async fn decrypt_binary(
        &self,
        hub_id: &str,
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.request("decrypt_binary", |reply| CryptoRequest::DecryptBinary {
            hub_id: hub_id.to_string(),
            data: data.to_vec(),
            reply,
        })
        .await?
    }

    /// Our Curve25519 identity key for the hub.
    pub async fn identity_key(&self, hub_id: &str) -> Result<String, CryptoError> {
        self.request("identity_key", |reply| CryptoRequest::IdentityKey {
            hub_id: hub_id.to_string(),
            reply,
        })
        .await?
    }

    /// Drop a hub's session and stored record.
    pub async fn clear_session(&self, hub_id: &str) -> Result<(), CryptoError> {
        self.request("clear_session", |reply| CryptoRequest::ClearSession {
            hub_id: hub_id.to_string(),
            reply,
        })
        .await
    }

    /// Drop every known hub.
    pub async fn clear_all_sessions(&self) -> Result<(), CryptoError> {
        self.request("clear_all_sessions", |reply| CryptoRequest::ClearAllSessions { reply })
            .await
    }

    /// Attach a liveness port. Returns the port id and the ping stream;
    /// answer each ping with [`Self::pong`] or be reaped after 21 s.
    pub async fn attach_port(&self) -> Result<(u64, mpsc::UnboundedReceiver<()>), CryptoError> {
        let (ping_tx, ping_rx) = mpsc::unbounded_channel();
        let port_id = self
            .request("attach_port", |reply| CryptoRequest::AttachPort { ping_tx, reply })
            .await?;
        Ok((port_id, ping_rx))
    }

    /// Answer a liveness ping.
    pub async fn pong(&self, port_id: u64) {
        let _ = self.tx.send(CryptoRequest::Pong { port_id }).await;
    }

    /// Stop the service.
    pub async fn shutdown(&self) -> Result<(), CryptoError> {
        self.tx
            .send(CryptoRequest::Shutdown)
            .await
            .map_err(|_| CryptoError::NotInitialized)
    }

    /// Handle with a closed channel; operations fail gracefully. For tests
    /// that never touch crypto.
    #[cfg(test)]
    #[must_use]
    pub fn mock() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Tracked liveness state for one attached port.
struct PortEntry {
    ping_tx: mpsc::UnboundedSender<()>,
    last_pong: Instant,
}

/// The crypto service running on its own thread.
#[derive(Debug)]
pub struct CryptoService;

impl CryptoService {
    /// Start the service on a dedicated thread over the given store.
    ///
    /// Returns a handle usable from any thread or task.
    pub fn start(store: Arc<dyn SessionStore>) -> Result<CryptoServiceHandle> {
        let (tx, rx) = mpsc::channel::<CryptoRequest>(256);

        std::thread::Builder::new()
            .name("crypto-service".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build crypto service runtime");

                rt.block_on(async move {
                    Self::run_service(store, rx).await;
                });
            })
            .context("Failed to spawn crypto service thread")?;

        log::info!("Started crypto service");
        Ok(CryptoServiceHandle { tx })
    }

    /// Main loop: requests until shutdown, interleaved with port pings.
    async fn run_service(store: Arc<dyn SessionStore>, mut rx: mpsc::Receiver<CryptoRequest>) {
        let engine = OlmEngine::new(store);
        let mut ports: HashMap<u64, PortEntry> = HashMap::new();
        let mut next_port_id: u64 = 1;

        let mut ping_interval = tokio::time::interval(PORT_PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        log::debug!("Crypto service ready, waiting for requests");

        loop {
            tokio::select! {
                request = rx.recv() => {
                    let Some(request) = request else { break; };
                    match request {
                        CryptoRequest::CreateSession { hub_id, bundle, reply } => {
                            let result = engine.create_session(&hub_id, &bundle).await;
                            let _ = reply.send(result);
                        }
                        CryptoRequest::LoadSession { hub_id, reply } => {
                            let _ = reply.send(engine.load_session(&hub_id).await);
                        }
                        CryptoRequest::HasSession { hub_id, reply } => {
                            let _ = reply.send(engine.has_session(&hub_id).await);
                        }
                        CryptoRequest::Encrypt { hub_id, plaintext, reply } => {
                            let _ = reply.send(engine.encrypt(&hub_id, &plaintext).await);
                        }
                        CryptoRequest::Decrypt { hub_id, envelope, reply } => {
                            let _ = reply.send(engine.decrypt(&hub_id, &envelope).await);
                        }
                        CryptoRequest::EncryptBinary { hub_id, plaintext, reply } => {
                            let _ = reply.send(engine.encrypt_binary(&hub_id, &plaintext).await);
                        }
                        CryptoRequest::DecryptBinary { hub_id, data, reply } => {
                            let _ = reply.send(engine.decrypt_binary(&hub_id, &data).await);
                        }
                        CryptoRequest::IdentityKey { hub_id, reply } => {
                            let _ = reply.send(engine.identity_key(&hub_id).await);
                        }
                        CryptoRequest::ClearSession { hub_id, reply } => {
                            engine.clear_session(&hub_id).await;
                            let _ = reply.send(());
                        }
                        CryptoRequest::ClearAllSessions { reply } => {
                            engine.clear_all_sessions().await;
                            let _ = reply.send(());
                        }
                        CryptoRequest::AttachPort { ping_tx, reply } => {
                            let port_id = next_port_id;
                            next_port_id += 1;
                            ports.insert(port_id, PortEntry {
                                ping_tx,
                                last_pong: Instant::now(),
                            });
                            log::debug!("Attached port {port_id} ({} total)", ports.len());
                            let _ = reply.send(port_id);
                        }
                        CryptoRequest::Pong { port_id } => {
                            if let Some(port) = ports.get_mut(&port_id) {
                                port.last_pong = Instant::now();
                            }
                        }
                        CryptoRequest::Shutdown => {
                            log::info!("Crypto service shutting down");
                            break;
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    let now = Instant::now();
                    ports.retain(|port_id, port| {
                        if now.duration_since(port.last_pong) > PORT_STALE_AFTER {
                            log::info!("Reaping stale port {port_id}");
                            return false;
                        }
                        if port.ping_tx.send(()).is_err() {
                            log::debug!("Port {port_id} closed, removing");
                            return false;
                        }
                        true
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::store::MemoryStore;
    use crate::engine::test_support::TestPeer;

    fn start_service() -> CryptoServiceHandle {
        CryptoService::start(Arc::new(MemoryStore::new())).expect("service starts")
    }

    #[tokio::test]
    async fn test_service_full_session_flow() {
        let handle = start_service();
        let mut peer = TestPeer::new();
        let bundle = peer.issue_bundle();

        let identity = handle.create_session("h1", bundle).await.unwrap();
        assert!(!identity.is_empty());
        assert!(handle.has_session("h1").await.unwrap());

        let envelope = handle.encrypt("h1", b"over the wall").await.unwrap();
        assert_eq!(peer.decrypt(&envelope), b"over the wall");

        let reply = peer.encrypt(b"and back");
        assert_eq!(handle.decrypt("h1", &reply).await.unwrap(), b"and back");

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_no_session_error_crosses_boundary() {
        let handle = start_service();
        assert!(matches!(
            handle.encrypt("missing", b"x").await,
            Err(CryptoError::NoSession)
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_handle_is_clone() {
        let handle = start_service();
        let mut peer = TestPeer::new();
        handle.create_session("h1", peer.issue_bundle()).await.unwrap();

        let handle2 = handle.clone();
        let id1 = handle.identity_key("h1").await.unwrap();
        let id2 = handle2.identity_key("h1").await.unwrap();
        assert_eq!(id1, id2);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_concurrent_encrypts_stay_consistent() {
        // Cross-tab serialization: concurrent encrypts through two handles
        // produce distinct, individually decryptable ciphertexts.
        let handle = start_service();
        let mut peer = TestPeer::new();
        handle.create_session("h1", peer.issue_bundle()).await.unwrap();

        let h1 = handle.clone();
        let h2 = handle.clone();
        let (a, b) = tokio::join!(h1.encrypt("h1", b"tab one"), h2.encrypt("h1", b"tab two"));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.ciphertext, b.ciphertext);

        let mut plains = vec![peer.decrypt(&a), peer.decrypt(&b)];
        plains.sort();
        assert_eq!(plains, vec![b"tab one".to_vec(), b"tab two".to_vec()]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_mock_fails_gracefully() {
        let handle = CryptoServiceHandle::mock();
        assert!(matches!(
            handle.has_session("h1").await,
            Err(CryptoError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_service_port_ping_pong() {
        let handle = start_service();
        let (port_id, mut ping_rx) = handle.attach_port().await.unwrap();
        assert!(port_id >= 1);

        // Answer one ping to prove the loop is alive; the interval's first
        // tick fires immediately.
        tokio::time::timeout(Duration::from_secs(8), ping_rx.recv())
            .await
            .expect("ping arrives")
            .expect("channel open");
        handle.pong(port_id).await;

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_service_clear_session() {
        let handle = start_service();
        let mut peer = TestPeer::new();
        handle.create_session("h1", peer.issue_bundle()).await.unwrap();
        assert!(handle.has_session("h1").await.unwrap());

        handle.clear_session("h1").await.unwrap();
        assert!(!handle.has_session("h1").await.unwrap());

        handle.shutdown().await.unwrap();
    }
}
