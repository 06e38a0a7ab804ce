//! Encrypted session persistence.
//!
//! Pickled Olm state must survive process restarts or every navigation
//! would force a re-pairing. State lives in a durable key-value store
//! behind the [`SessionStore`] trait:
//!
//! ```text
//! sessions/<hub_id>            # AES-GCM encrypted {account, session, pinned peer}
//! encryption_keys/pickle_key   # 32 raw bytes (legacy JWK records accepted)
//! ```
//!
//! The pickle key is stored as raw bytes, not an opaque key object -
//! exported key objects do not survive store migrations across runtimes.
//!
//! Read-side tolerance: legacy plaintext records are accepted and
//! re-encrypted on the next persist; a record that fails to decrypt under
//! the current key is deleted and reported as "no session" (the peer will
//! be re-paired).

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

use crate::crypto::{self, EncryptedData};

/// Record format version for encrypted session records.
const RECORD_VERSION: u8 = 6;

/// Reserved store key holding the device pickle key.
const PICKLE_KEY_KEY: &str = "encryption_keys/pickle_key";

/// Store key for a hub's session record.
pub fn session_key(hub_id: &str) -> String {
    format!("sessions/{hub_id}")
}

/// Durable single-key storage. No range scans are required.
pub trait SessionStore: Send + Sync {
    /// Fetch the value at `key`, if present.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Store `value` at `key`, replacing any existing value.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Remove the value at `key` if present.
    fn delete(&self, key: &str) -> Result<()>;
}

/// File-backed store under the user config directory.
///
/// Keys map directly to relative paths; values are written with 0600
/// permissions since they hold ratchet state.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create a store at the default config location.
    pub fn default_location() -> Result<Self> {
        let root = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("botster-link");
        Ok(Self::new(root))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Store keys are internal ("sessions/<id>"); reject anything that
        // could escape the root.
        if key.split('/').any(|part| part.is_empty() || part == "..") {
            anyhow::bail!("Invalid store key: {key}");
        }
        Ok(self.root.join(key))
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .with_context(|| format!("Failed to read store key {key}"))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create store directory")?;
        }
        fs::write(&path, value).with_context(|| format!("Failed to write store key {key}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set store file permissions")?;
        }

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to delete store key {key}"))?;
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral embedders.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().expect("store lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map
            .write()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().expect("store lock poisoned").remove(key);
        Ok(())
    }
}

/// The peer identity pinned at pairing time.
///
/// Raw one-time key bytes from the bundle are deliberately not stored;
/// only the keys needed for identity pinning and refresh verification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinnedPeer {
    /// Peer's Curve25519 identity key (base64 unpadded).
    pub curve25519_key: String,
    /// Peer's Ed25519 signing key (base64 unpadded).
    pub ed25519_key: String,
}

/// One hub's persisted crypto state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubRecord {
    /// Pickled Olm account (vodozemac's serialized format).
    pub account_pickle: String,
    /// Pickled Olm session, if one has been established.
    pub session_pickle: Option<String>,
    /// The pinned peer from the accepted bundle.
    pub peer: PinnedPeer,
}

/// Legacy JWK shape for the pickle key (older builds stored exported
/// key objects).
#[derive(Debug, Deserialize)]
struct LegacyJwk {
    k: String,
}

/// A [`SessionStore`] wrapped with the device pickle key and the at-rest
/// record encryption.
pub struct EncryptedStore {
    store: Arc<dyn SessionStore>,
    key_cache: RwLock<Option<Zeroizing<[u8; 32]>>>,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field(
                "key_loaded",
                &self.key_cache.read().expect("key cache lock poisoned").is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl EncryptedStore {
    /// Wrap a raw store.
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            key_cache: RwLock::new(None),
        }
    }

    /// Get or create the device pickle key.
    ///
    /// Accepts three on-disk shapes: 32 raw bytes (current), a JSON JWK
    /// with a base64url `k` field (legacy), or nothing (generate fresh).
    fn pickle_key(&self) -> Result<[u8; 32]> {
        {
            let cache = self.key_cache.read().expect("key cache lock poisoned");
            if let Some(key) = cache.as_ref() {
                return Ok(**key);
            }
        }

        let key: [u8; 32] = match self.store.get(PICKLE_KEY_KEY)? {
            Some(raw) if raw.len() == 32 => raw.try_into().expect("length checked"),
            Some(raw) => {
                // Legacy JWK import
                let jwk: LegacyJwk = serde_json::from_slice(&raw)
                    .context("Pickle key is neither raw bytes nor a JWK")?;
                let decoded = URL_SAFE_NO_PAD
                    .decode(&jwk.k)
                    .context("Invalid JWK key encoding")?;
                let key: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("JWK key has wrong length"))?;
                // Normalize to raw bytes for the next reader.
                self.store.put(PICKLE_KEY_KEY, &key)?;
                log::info!("Migrated legacy JWK pickle key to raw bytes");
                key
            }
            None => {
                let mut key = [0u8; 32];
                rand::rng().fill_bytes(&mut key);
                self.store.put(PICKLE_KEY_KEY, &key)?;
                log::info!("Generated new device pickle key");
                key
            }
        };

        let mut cache = self.key_cache.write().expect("key cache lock poisoned");
        *cache = Some(Zeroizing::new(key));
        Ok(key)
    }

    /// Load a hub's record.
    ///
    /// Legacy plaintext records load successfully (and get re-encrypted on
    /// the next save). Records that fail to decrypt under the current key
    /// are deleted; the caller sees "no session".
    pub fn load_record(&self, hub_id: &str) -> Result<Option<HubRecord>> {
        let key_name = session_key(hub_id);
        let Some(raw) = self.store.get(&key_name)? else {
            return Ok(None);
        };

        if let Ok(encrypted) = serde_json::from_slice::<EncryptedData>(&raw) {
            let key = self.pickle_key()?;
            match crypto::decrypt(&key, &encrypted) {
                Ok(plaintext) => {
                    let record: HubRecord = serde_json::from_slice(&plaintext)
                        .context("Failed to deserialize session record")?;
                    return Ok(Some(record));
                }
                Err(e) => {
                    log::warn!(
                        "Session record for hub {} undecryptable under current key ({e}), deleting",
                        &hub_id[..hub_id.len().min(8)]
                    );
                    self.store.delete(&key_name)?;
                    return Ok(None);
                }
            }
        }

        // Legacy plaintext record from before at-rest encryption shipped.
        match serde_json::from_slice::<HubRecord>(&raw) {
            Ok(record) => {
                log::info!(
                    "Loaded legacy plaintext session record for hub {}",
                    &hub_id[..hub_id.len().min(8)]
                );
                Ok(Some(record))
            }
            Err(e) => {
                log::warn!("Unreadable session record for hub, deleting: {e}");
                self.store.delete(&key_name)?;
                Ok(None)
            }
        }
    }

    /// Save a hub's record, AES-GCM encrypted under the pickle key.
    pub fn save_record(&self, hub_id: &str, record: &HubRecord) -> Result<()> {
        let key = self.pickle_key()?;
        let plaintext = serde_json::to_vec(record).context("Failed to serialize session record")?;
        let encrypted = crypto::encrypt(&key, &plaintext, RECORD_VERSION)?;
        let raw = serde_json::to_vec(&encrypted).context("Failed to serialize encrypted record")?;
        self.store.put(&session_key(hub_id), &raw)?;
        log::debug!(
            "Persisted session record for hub {}",
            &hub_id[..hub_id.len().min(8)]
        );
        Ok(())
    }

    /// Delete a hub's record.
    pub fn delete_record(&self, hub_id: &str) -> Result<()> {
        self.store.delete(&session_key(hub_id))
    }
}
