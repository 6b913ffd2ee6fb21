//! Payload encryption, integrity tags and hashing
//!
//! Every engine implements [`CipherEngine`], so the node and the tests can
//! swap the transform without touching any caller:
//!
//! ```text
//! ┌──────────────┐  encrypt(plaintext, peer_pub)   ┌──────────────────────┐
//! │  MeshNode    │ ──────────────────────────────▶ │ dyn CipherEngine     │
//! │              │ ◀────────────────────────────── │  KeystreamCipher     │
//! └──────────────┘       EncryptedEnvelope         │  SealedCipher        │
//!                                                  └──────────────────────┘
//! ```
//!
//! Both engines derive the per-peer key from the X25519 agreement between the
//! local private key and the peer's public key, so the sender encrypting with
//! `(a.private, b.public)` and the receiver decrypting with
//! `(b.private, a.public)` arrive at the same key.
//!
//! ## Failure kinds
//!
//! - envelope missing a field: [`MeshError::Malformed`]
//! - anything wrong with the protected body (bad tag, flipped bit, body that
//!   no longer decodes): [`MeshError::AuthenticationFailed`], with no
//!   plaintext returned

mod keystream;
mod sealed;

pub use keystream::{derive_key, KeystreamCipher, KEYSTREAM_ALGORITHM};
pub use sealed::{SealedCipher, SEALED_ALGORITHM};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{MeshError, MeshResult};

/// The encrypted form of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    /// Base64 body (engine specific)
    pub ciphertext: String,
    /// Per-call random initialization vector, hex
    pub iv: String,
    /// Engine tag, e.g. `sha256`
    pub algorithm: String,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl EncryptedEnvelope {
    /// Decode an envelope from a packet payload.
    pub fn from_value(value: &serde_json::Value) -> MeshResult<Self> {
        let envelope: Self = serde_json::from_value(value.clone())
            .map_err(|e| MeshError::Malformed(format!("encrypted envelope: {}", e)))?;
        if envelope.ciphertext.is_empty() || envelope.iv.is_empty() {
            return Err(MeshError::Malformed(
                "encrypted envelope missing ciphertext or iv".into(),
            ));
        }
        Ok(envelope)
    }

    /// Encode as a JSON value for a packet payload.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "ciphertext": self.ciphertext,
            "iv": self.iv,
            "algorithm": self.algorithm,
            "timestamp": self.timestamp,
        })
    }
}

/// Result of a successful decrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub timestamp: i64,
}

impl Decrypted {
    /// Plaintext as UTF-8.
    pub fn text(&self) -> MeshResult<String> {
        String::from_utf8(self.plaintext.clone())
            .map_err(|e| MeshError::Malformed(format!("plaintext is not UTF-8: {}", e)))
    }
}

/// Capability interface for the local cryptographic transform.
///
/// Implementations hold the local key pair; peer keys are passed per call.
pub trait CipherEngine: Send + Sync {
    /// Algorithm tag written into every envelope.
    fn algorithm(&self) -> &'static str;

    /// Hex public key of the local pair.
    fn local_public_key(&self) -> &str;

    /// Encrypt for a recipient.
    ///
    /// # Arguments
    ///
    /// * `plaintext` - Bytes to protect
    /// * `recipient_public_key` - Recipient's hex public key
    fn encrypt(&self, plaintext: &[u8], recipient_public_key: &str) -> MeshResult<EncryptedEnvelope>;

    /// Decrypt an envelope from a sender.
    ///
    /// # Arguments
    ///
    /// * `envelope` - Envelope produced by the sender's `encrypt`
    /// * `sender_public_key` - Sender's hex public key
    fn decrypt(&self, envelope: &EncryptedEnvelope, sender_public_key: &str) -> MeshResult<Decrypted>;

    /// Keyed tag over `data` using the local private key.
    fn sign(&self, data: &[u8]) -> String;

    /// Check a tag produced by [`CipherEngine::sign`].
    ///
    /// This is a symmetric MAC: `key` must be the same key material the
    /// signer used, not a public key.
    fn verify(&self, data: &[u8], signature: &str, key: &str) -> bool;

    /// Stateless one-way hash, hex.
    fn hash(&self, data: &[u8]) -> String {
        sha256_hex(data)
    }
}

/// SHA-256, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time string equality.
pub(crate) fn ct_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A message exported together with its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub encrypted: EncryptedEnvelope,
}

/// Plaintext recovered by [`open_with_metadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedMessage {
    pub from: String,
    pub to: String,
    pub message: String,
    pub timestamp: i64,
}

/// Encrypt a text message and wrap it with `{from, to, timestamp}` as one
/// base64 string, independent of any packet or transport.
pub fn seal_with_metadata(
    engine: &dyn CipherEngine,
    message: &str,
    recipient_id: &str,
    recipient_public_key: &str,
    sender_id: &str,
) -> MeshResult<String> {
    let sealed = SealedMessage {
        from: sender_id.to_string(),
        to: recipient_id.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        encrypted: engine.encrypt(message.as_bytes(), recipient_public_key)?,
    };
    let json = serde_json::to_vec(&sealed)?;
    Ok(BASE64.encode(json))
}

/// Reverse of [`seal_with_metadata`].
pub fn open_with_metadata(
    engine: &dyn CipherEngine,
    data: &str,
    sender_public_key: &str,
) -> MeshResult<OpenedMessage> {
    let json = BASE64
        .decode(data)
        .map_err(|e| MeshError::Malformed(format!("sealed message is not base64: {}", e)))?;
    let sealed: SealedMessage = serde_json::from_slice(&json)
        .map_err(|e| MeshError::Malformed(format!("sealed message: {}", e)))?;

    let decrypted = engine.decrypt(&sealed.encrypted, sender_public_key)?;
    Ok(OpenedMessage {
        from: sealed.from,
        to: sealed.to,
        message: decrypted.text()?,
        timestamp: sealed.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_envelope_from_value_requires_fields() {
        let missing_iv = serde_json::json!({
            "ciphertext": "abc",
            "algorithm": "sha256",
            "timestamp": 1
        });
        assert!(matches!(
            EncryptedEnvelope::from_value(&missing_iv),
            Err(MeshError::Malformed(_))
        ));

        let empty = serde_json::json!({
            "ciphertext": "",
            "iv": "00",
            "algorithm": "sha256",
            "timestamp": 1
        });
        assert!(matches!(
            EncryptedEnvelope::from_value(&empty),
            Err(MeshError::Malformed(_))
        ));
    }

    #[test]
    fn test_envelope_value_roundtrip() {
        let env = EncryptedEnvelope {
            ciphertext: "Y2lwaGVy".into(),
            iv: "00ff".into(),
            algorithm: KEYSTREAM_ALGORITHM.into(),
            timestamp: 42,
        };
        assert_eq!(EncryptedEnvelope::from_value(&env.to_value()).unwrap(), env);
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq("abc", "abc"));
        assert!(!ct_eq("abc", "abd"));
        assert!(!ct_eq("abc", "abcd"));
    }

    #[test]
    fn test_metadata_roundtrip_both_engines() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let engines: Vec<(Box<dyn CipherEngine>, Box<dyn CipherEngine>)> = vec![
            (
                Box::new(KeystreamCipher::new(alice.clone())),
                Box::new(KeystreamCipher::new(bob.clone())),
            ),
            (
                Box::new(SealedCipher::new(alice.clone())),
                Box::new(SealedCipher::new(bob.clone())),
            ),
        ];

        for (a, b) in engines {
            let sealed =
                seal_with_metadata(&*a, "hi bob", "bbb222", &bob.public_key, "aaa111")
                    .unwrap();
            let opened = open_with_metadata(&*b, &sealed, &alice.public_key).unwrap();
            assert_eq!(opened.from, "aaa111");
            assert_eq!(opened.to, "bbb222");
            assert_eq!(opened.message, "hi bob");
        }
    }

    #[test]
    fn test_open_with_metadata_rejects_garbage() {
        let engine = KeystreamCipher::new(KeyPair::generate());
        assert!(matches!(
            open_with_metadata(&engine, "!!!", &KeyPair::generate().public_key),
            Err(MeshError::Malformed(_))
        ));
    }
}
