//! Local X25519 key pair and its lifecycle
//!
//! The private key is 32 bytes from the OS-seeded RNG; the public key is its
//! X25519 image, so two nodes can agree on the same shared material from
//! `(own private, peer public)`. Keys are stored hex-encoded and are
//! length- and consistency-checked on every load.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{MeshError, MeshResult};
use crate::storage::{bounded, keys, KvStore};

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// Key length in hex characters.
pub const KEY_HEX_LEN: usize = KEY_LEN * 2;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Decode a hex key and check its length.
pub(crate) fn decode_key(label: &str, hex_key: &str) -> MeshResult<[u8; KEY_LEN]> {
    if hex_key.len() != KEY_HEX_LEN {
        return Err(MeshError::KeyCorrupted(format!(
            "{} has {} hex chars, expected {}",
            label,
            hex_key.len(),
            KEY_HEX_LEN
        )));
    }
    let bytes = hex::decode(hex_key)
        .map_err(|e| MeshError::KeyCorrupted(format!("{} is not hex: {}", label, e)))?;
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// The local key pair, hex-encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    /// X25519 public key (64 hex chars)
    pub public_key: String,
    /// X25519 private key (64 hex chars)
    pub private_key: String,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created_at: i64,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let mut private = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut private);
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);

        Self {
            public_key: hex::encode(public.as_bytes()),
            private_key: hex::encode(private),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Check lengths, hex encoding and that the public key matches the private key.
    ///
    /// Any failure means the stored record is corrupt and is fatal.
    pub fn validate(&self) -> MeshResult<()> {
        let private = decode_key("private key", &self.private_key)?;
        let public = decode_key("public key", &self.public_key)?;

        let derived = PublicKey::from(&StaticSecret::from(private));
        if derived.as_bytes() != &public {
            return Err(MeshError::KeyCorrupted(
                "public key does not match private key".into(),
            ));
        }
        Ok(())
    }

    /// Raw public key bytes.
    pub fn public_bytes(&self) -> MeshResult<[u8; KEY_LEN]> {
        decode_key("public key", &self.public_key)
    }

    /// X25519 shared secret with a peer's hex public key.
    ///
    /// Symmetric: `a.shared_secret(b.pub) == b.shared_secret(a.pub)`.
    pub fn shared_secret(&self, peer_public_hex: &str) -> MeshResult<[u8; KEY_LEN]> {
        let private = decode_key("private key", &self.private_key)?;
        let peer = decode_key("peer public key", peer_public_hex)
            .map_err(|e| MeshError::Malformed(e.to_string()))?;

        let secret = StaticSecret::from(private);
        let shared = secret.diffie_hellman(&PublicKey::from(peer));
        Ok(*shared.as_bytes())
    }
}

/// Whether keys exist and when they were made, without generating any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub has_keys: bool,
    pub created_at: Option<i64>,
}

/// Produces, rotates and deletes the local [`KeyPair`].
pub struct KeyManager {
    kv: Arc<dyn KvStore>,
    cached: Mutex<Option<KeyPair>>,
    timeout: Duration,
}

impl KeyManager {
    /// Create a manager over the given persistence collaborator.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cached: Mutex::new(None),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the upper bound on each persistence call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Return the persisted key pair, creating one on first access.
    ///
    /// A stored pair that fails [`KeyPair::validate`] is returned as
    /// [`MeshError::KeyCorrupted`] and never replaced silently.
    pub async fn get_or_create(&self) -> MeshResult<KeyPair> {
        let mut cached = self.cached.lock().await;
        if let Some(pair) = cached.as_ref() {
            return Ok(pair.clone());
        }

        match self.load().await {
            Ok(Some(pair)) => {
                *cached = Some(pair.clone());
                return Ok(pair);
            }
            Ok(None) => {}
            Err(e) if e.is_resource() => {
                tracing::warn!(error = %e, "Key store unavailable, using in-memory keys");
            }
            Err(e) => return Err(e),
        }

        let pair = KeyPair::generate();
        self.persist(&pair).await;
        tracing::info!(public_key = %&pair.public_key[..8], "Generated key pair");

        *cached = Some(pair.clone());
        Ok(pair)
    }

    /// Replace the key pair unconditionally.
    ///
    /// Anything encrypted under the previous pair becomes undecryptable;
    /// no key history is kept.
    pub async fn rotate(&self) -> MeshResult<KeyPair> {
        let mut cached = self.cached.lock().await;
        let pair = KeyPair::generate();
        self.persist(&pair).await;

        tracing::warn!(
            public_key = %&pair.public_key[..8],
            "Rotated key pair; messages under the old key can no longer be decrypted"
        );
        *cached = Some(pair.clone());
        Ok(pair)
    }

    /// Remove the persisted key pair.
    pub async fn delete(&self) -> MeshResult<()> {
        let mut cached = self.cached.lock().await;
        bounded(self.timeout, "key delete", self.kv.remove(keys::KEY_PAIR)).await?;
        *cached = None;
        tracing::warn!("Deleted key pair");
        Ok(())
    }

    /// Report whether keys exist without creating them.
    pub async fn metadata(&self) -> MeshResult<KeyMetadata> {
        if let Some(pair) = self.cached.lock().await.as_ref() {
            return Ok(KeyMetadata {
                has_keys: true,
                created_at: Some(pair.created_at),
            });
        }
        let stored = self.load().await?;
        Ok(KeyMetadata {
            has_keys: stored.is_some(),
            created_at: stored.map(|p| p.created_at),
        })
    }

    async fn load(&self) -> MeshResult<Option<KeyPair>> {
        let raw = bounded(self.timeout, "key load", self.kv.get(keys::KEY_PAIR)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let pair: KeyPair = serde_json::from_str(&raw)
            .map_err(|e| MeshError::KeyCorrupted(format!("key record: {}", e)))?;
        pair.validate()?;
        Ok(Some(pair))
    }

    async fn persist(&self, pair: &KeyPair) {
        let json = match serde_json::to_string(pair) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode key pair");
                return;
            }
        };
        if let Err(e) = bounded(self.timeout, "key save", self.kv.set(keys::KEY_PAIR, &json)).await {
            tracing::warn!(error = %e, "Failed to persist key pair");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKv;

    fn manager() -> (KeyManager, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (KeyManager::new(kv.clone()), kv)
    }

    #[test]
    fn test_generate_has_fixed_lengths() {
        let pair = KeyPair::generate();
        assert_eq!(pair.public_key.len(), KEY_HEX_LEN);
        assert_eq!(pair.private_key.len(), KEY_HEX_LEN);
        assert!(pair.validate().is_ok());
    }

    #[test]
    fn test_generate_is_random() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_eq!(
            a.shared_secret(&b.public_key).unwrap(),
            b.shared_secret(&a.public_key).unwrap()
        );
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = KeyPair::generate();
        let debug = format!("{:?}", pair);
        assert!(!debug.contains(&pair.private_key));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let (manager, _kv) = manager();
        let a = manager.get_or_create().await.unwrap();
        let b = manager.get_or_create().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_rotate_replaces_pair() {
        let (manager, kv) = manager();
        let before = manager.get_or_create().await.unwrap();
        let after = manager.rotate().await.unwrap();
        assert_ne!(before.public_key, after.public_key);

        // Persisted pair is the rotated one
        let reloaded = KeyManager::new(kv).get_or_create().await.unwrap();
        assert_eq!(reloaded, after);
    }

    #[tokio::test]
    async fn test_delete_then_create_makes_fresh_pair() {
        let (manager, kv) = manager();
        let before = manager.get_or_create().await.unwrap();

        manager.delete().await.unwrap();
        assert!(!kv.contains(keys::KEY_PAIR));
        assert!(!manager.metadata().await.unwrap().has_keys);

        let after = manager.get_or_create().await.unwrap();
        assert_ne!(before.private_key, after.private_key);
    }

    #[tokio::test]
    async fn test_metadata_does_not_generate() {
        let (manager, kv) = manager();
        let meta = manager.metadata().await.unwrap();
        assert!(!meta.has_keys);
        assert!(meta.created_at.is_none());
        assert!(kv.is_empty());

        let pair = manager.get_or_create().await.unwrap();
        let meta = manager.metadata().await.unwrap();
        assert!(meta.has_keys);
        assert_eq!(meta.created_at, Some(pair.created_at));
    }

    #[tokio::test]
    async fn test_short_stored_key_is_fatal() {
        let (manager, kv) = manager();
        let mut pair = KeyPair::generate();
        pair.private_key.truncate(60);
        kv.set(keys::KEY_PAIR, &serde_json::to_string(&pair).unwrap())
            .await
            .unwrap();

        let err = manager.get_or_create().await.unwrap_err();
        assert!(matches!(err, MeshError::KeyCorrupted(_)));
        // Corrupt record is left for inspection
        assert!(kv.contains(keys::KEY_PAIR));
    }

    #[tokio::test]
    async fn test_mismatched_public_key_is_fatal() {
        let (manager, kv) = manager();
        let mut pair = KeyPair::generate();
        pair.public_key = KeyPair::generate().public_key;
        kv.set(keys::KEY_PAIR, &serde_json::to_string(&pair).unwrap())
            .await
            .unwrap();

        assert!(matches!(
            manager.get_or_create().await,
            Err(MeshError::KeyCorrupted(_))
        ));
    }
}
