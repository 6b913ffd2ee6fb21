//! AEAD engine: X25519 + HKDF-SHA256 + ChaCha20-Poly1305
//!
//! Same envelope shape as the keystream engine. The `iv` field carries the
//! 12-byte nonce and the envelope timestamp is bound as associated data.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use super::{ct_eq, CipherEngine, Decrypted, EncryptedEnvelope};
use crate::error::{MeshError, MeshResult};
use crate::identity::{KeyPair, KEY_LEN};

/// Algorithm tag for this engine.
pub const SEALED_ALGORITHM: &str = "x25519-chacha20poly1305";

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
const NONCE_SIZE: usize = 12;

const HKDF_INFO: &[u8] = b"whisper/1 message key";
const SIGN_CONTEXT: &str = "whisper/1 signing key";

/// X25519 + ChaCha20-Poly1305 engine.
pub struct SealedCipher {
    keys: KeyPair,
}

impl SealedCipher {
    /// Create an engine for the given local key pair.
    pub fn new(keys: KeyPair) -> Self {
        Self { keys }
    }

    fn cipher_for(&self, peer_public_key: &str) -> MeshResult<ChaCha20Poly1305> {
        let shared = self.keys.shared_secret(peer_public_key)?;
        let hk = Hkdf::<Sha256>::new(None, &shared);
        let mut key = [0u8; KEY_LEN];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|e| MeshError::Crypto(format!("HKDF expand failed: {}", e)))?;
        Ok(ChaCha20Poly1305::new((&key).into()))
    }
}

impl CipherEngine for SealedCipher {
    fn algorithm(&self) -> &'static str {
        SEALED_ALGORITHM
    }

    fn local_public_key(&self) -> &str {
        &self.keys.public_key
    }

    fn encrypt(&self, plaintext: &[u8], recipient_public_key: &str) -> MeshResult<EncryptedEnvelope> {
        let cipher = self.cipher_for(recipient_public_key)?;

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let aad = timestamp.to_be_bytes();

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| MeshError::Crypto(format!("Encryption failed: {}", e)))?;

        Ok(EncryptedEnvelope {
            ciphertext: BASE64.encode(sealed),
            iv: hex::encode(nonce),
            algorithm: SEALED_ALGORITHM.to_string(),
            timestamp,
        })
    }

    fn decrypt(&self, envelope: &EncryptedEnvelope, sender_public_key: &str) -> MeshResult<Decrypted> {
        if envelope.ciphertext.is_empty() || envelope.iv.is_empty() {
            return Err(MeshError::Malformed(
                "encrypted envelope missing ciphertext or iv".into(),
            ));
        }
        if envelope.algorithm != SEALED_ALGORITHM {
            return Err(MeshError::Malformed(format!(
                "unsupported algorithm {}",
                envelope.algorithm
            )));
        }
        let cipher = self.cipher_for(sender_public_key)?;

        let nonce = hex::decode(&envelope.iv)
            .ok()
            .filter(|n| n.len() == NONCE_SIZE)
            .ok_or_else(|| MeshError::AuthenticationFailed("nonce unreadable".into()))?;
        let sealed = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| MeshError::AuthenticationFailed("ciphertext is not valid base64".into()))?;
        let aad = envelope.timestamp.to_be_bytes();

        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| MeshError::AuthenticationFailed("AEAD tag mismatch".into()))?;

        Ok(Decrypted {
            plaintext,
            timestamp: envelope.timestamp,
        })
    }

    fn sign(&self, data: &[u8]) -> String {
        keyed_tag(data, &self.keys.private_key)
    }

    fn verify(&self, data: &[u8], signature: &str, key: &str) -> bool {
        ct_eq(&keyed_tag(data, key), signature)
    }
}

fn keyed_tag(data: &[u8], key: &str) -> String {
    let mac_key = blake3::derive_key(SIGN_CONTEXT, key.as_bytes());
    blake3::keyed_hash(&mac_key, data).to_hex().to_string()
}
