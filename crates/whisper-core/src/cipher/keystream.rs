//! Hash-based keystream cipher
//!
//! The wire-compatible transform used by Whisper peers:
//!
//! - key = `sha256_hex(hex(x25519(local_private, peer_public)))`
//! - block `n` of the keystream = `sha256("{key}:{iv}:{n}")`
//! - data = base64(plaintext XOR keystream)
//! - authTag = `sha256_hex("{iv}:{data}:{key}")`
//! - ciphertext = base64(JSON `{data, authTag, timestamp}`)
//!
//! This is not an audited AEAD. [`SealedCipher`](super::SealedCipher) is the
//! drop-in replacement.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ct_eq, sha256_hex, CipherEngine, Decrypted, EncryptedEnvelope};
use crate::error::{MeshError, MeshResult};
use crate::identity::KeyPair;

/// Algorithm tag for this engine.
pub const KEYSTREAM_ALGORITHM: &str = "sha256";

/// IV length in bytes.
const IV_SIZE: usize = 16;

/// Hash shared secret material into a hex key. Deterministic.
pub fn derive_key(shared_secret: &str) -> String {
    sha256_hex(shared_secret.as_bytes())
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedBody {
    data: String,
    auth_tag: String,
    timestamp: i64,
}

fn keystream(len: usize, key_hex: &str, iv_hex: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter: u64 = 0;
    while out.len() < len {
        let block = Sha256::digest(format!("{}:{}:{}", key_hex, iv_hex, counter).as_bytes());
        let take = (len - out.len()).min(block.len());
        out.extend_from_slice(&block[..take]);
        counter += 1;
    }
    out
}

fn xor(data: &[u8], stream: &[u8]) -> Vec<u8> {
    data.iter().zip(stream).map(|(d, k)| d ^ k).collect()
}

fn auth_tag(iv: &str, data: &str, key: &str) -> String {
    sha256_hex(format!("{}:{}:{}", iv, data, key).as_bytes())
}

fn tamper(reason: &str) -> MeshError {
    MeshError::AuthenticationFailed(reason.to_string())
}

/// Keystream XOR cipher with a hash tag.
pub struct KeystreamCipher {
    keys: KeyPair,
}

impl KeystreamCipher {
    /// Create an engine for the given local key pair.
    pub fn new(keys: KeyPair) -> Self {
        Self { keys }
    }

    fn peer_key(&self, peer_public_key: &str) -> MeshResult<String> {
        let shared = self.keys.shared_secret(peer_public_key)?;
        Ok(derive_key(&hex::encode(shared)))
    }
}

impl CipherEngine for KeystreamCipher {
    fn algorithm(&self) -> &'static str {
        KEYSTREAM_ALGORITHM
    }

    fn local_public_key(&self) -> &str {
        &self.keys.public_key
    }

    fn encrypt(&self, plaintext: &[u8], recipient_public_key: &str) -> MeshResult<EncryptedEnvelope> {
        let key = self.peer_key(recipient_public_key)?;

        let mut iv_bytes = [0u8; IV_SIZE];
        rand::rng().fill_bytes(&mut iv_bytes);
        let iv = hex::encode(iv_bytes);

        let data = BASE64.encode(xor(plaintext, &keystream(plaintext.len(), &key, &iv)));
        let timestamp = chrono::Utc::now().timestamp_millis();
        let body = SealedBody {
            auth_tag: auth_tag(&iv, &data, &key),
            data,
            timestamp,
        };

        Ok(EncryptedEnvelope {
            ciphertext: BASE64.encode(serde_json::to_vec(&body)?),
            iv,
            algorithm: KEYSTREAM_ALGORITHM.to_string(),
            timestamp,
        })
    }

    fn decrypt(&self, envelope: &EncryptedEnvelope, sender_public_key: &str) -> MeshResult<Decrypted> {
        if envelope.ciphertext.is_empty() || envelope.iv.is_empty() {
            return Err(MeshError::Malformed(
                "encrypted envelope missing ciphertext or iv".into(),
            ));
        }
        if envelope.algorithm != KEYSTREAM_ALGORITHM {
            return Err(MeshError::Malformed(format!(
                "unsupported algorithm {}",
                envelope.algorithm
            )));
        }
        let key = self.peer_key(sender_public_key)?;

        let raw = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|_| tamper("ciphertext is not valid base64"))?;
        let body: SealedBody =
            serde_json::from_slice(&raw).map_err(|_| tamper("ciphertext body unreadable"))?;

        let expected = auth_tag(&envelope.iv, &body.data, &key);
        if !ct_eq(&expected, &body.auth_tag) {
            return Err(tamper("integrity tag mismatch"));
        }
        // the body timestamp is not under the tag; pin it to the envelope
        if body.timestamp != envelope.timestamp {
            return Err(tamper("timestamp mismatch"));
        }

        let cipher_bytes = BASE64
            .decode(&body.data)
            .map_err(|_| tamper("data is not valid base64"))?;
        let plaintext = xor(
            &cipher_bytes,
            &keystream(cipher_bytes.len(), &key, &envelope.iv),
        );

        Ok(Decrypted {
            plaintext,
            timestamp: body.timestamp,
        })
    }

    fn sign(&self, data: &[u8]) -> String {
        mac(data, &self.keys.private_key)
    }

    fn verify(&self, data: &[u8], signature: &str, key: &str) -> bool {
        ct_eq(&mac(data, key), signature)
    }
}

fn mac(data: &[u8], key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(b":");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (KeystreamCipher, KeystreamCipher, KeyPair, KeyPair) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        (
            KeystreamCipher::new(a.clone()),
            KeystreamCipher::new(b.clone()),
            a,
            b,
        )
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        assert_eq!(derive_key("secret"), derive_key("secret"));
        assert_ne!(derive_key("secret"), derive_key("secret2"));
        assert_eq!(derive_key("secret").len(), 64);
    }

    #[test]
    fn test_keystream_spans_blocks() {
        let ks = keystream(70, "k", "iv");
        assert_eq!(ks.len(), 70);
        // First block is sha256("k:iv:0")
        assert_eq!(&ks[..32], Sha256::digest(b"k:iv:0").as_slice());
        assert_eq!(&ks[32..64], Sha256::digest(b"k:iv:1").as_slice());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (alice, bob, a, b) = pair();
        let env = alice.encrypt(b"hello", &b.public_key).unwrap();
        assert_eq!(env.algorithm, "sha256");
        assert_eq!(env.iv.len(), 32);

        let out = bob.decrypt(&env, &a.public_key).unwrap();
        assert_eq!(out.plaintext, b"hello");
        assert_eq!(out.text().unwrap(), "hello");
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let (alice, bob, a, b) = pair();
        let env = alice.encrypt(b"", &b.public_key).unwrap();
        assert!(bob.decrypt(&env, &a.public_key).unwrap().plaintext.is_empty());
    }

    #[test]
    fn test_iv_is_fresh_per_call() {
        let (alice, _bob, _a, b) = pair();
        let e1 = alice.encrypt(b"same", &b.public_key).unwrap();
        let e2 = alice.encrypt(b"same", &b.public_key).unwrap();
        assert_ne!(e1.iv, e2.iv);
        assert_ne!(e1.ciphertext, e2.ciphertext);
    }

    #[test]
    fn test_wrong_sender_key_fails_authentication() {
        let (alice, bob, _a, b) = pair();
        let mallory = KeyPair::generate();
        let env = alice.encrypt(b"secret", &b.public_key).unwrap();

        assert!(matches!(
            bob.decrypt(&env, &mallory.public_key),
            Err(MeshError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_tampered_iv_fails() {
        let (alice, bob, a, b) = pair();
        let mut env = alice.encrypt(b"secret", &b.public_key).unwrap();
        let flipped = if env.iv.starts_with('0') { "1" } else { "0" };
        env.iv.replace_range(0..1, flipped);

        assert!(matches!(
            bob.decrypt(&env, &a.public_key),
            Err(MeshError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_tampered_data_fails() {
        let (alice, bob, a, b) = pair();
        let mut env = alice.encrypt(b"secret message", &b.public_key).unwrap();

        let raw = BASE64.decode(&env.ciphertext).unwrap();
        let mut body: SealedBody = serde_json::from_slice(&raw).unwrap();
        let mut data = BASE64.decode(&body.data).unwrap();
        data[0] ^= 0x01;
        body.data = BASE64.encode(&data);
        env.ciphertext = BASE64.encode(serde_json::to_vec(&body).unwrap());

        assert!(matches!(
            bob.decrypt(&env, &a.public_key),
            Err(MeshError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_tampered_timestamp_fails() {
        let (alice, bob, a, b) = pair();
        let mut env = alice.encrypt(b"secret", &b.public_key).unwrap();
        env.timestamp += 1;

        assert!(matches!(
            bob.decrypt(&env, &a.public_key),
            Err(MeshError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_missing_fields_are_structural() {
        let (alice, bob, a, b) = pair();
        let mut env = alice.encrypt(b"x", &b.public_key).unwrap();
        env.iv.clear();
        assert!(matches!(
            bob.decrypt(&env, &a.public_key),
            Err(MeshError::Malformed(_))
        ));
    }

    #[test]
    fn test_foreign_algorithm_is_structural() {
        let (alice, bob, a, b) = pair();
        let mut env = alice.encrypt(b"x", &b.public_key).unwrap();
        env.algorithm = "x25519-chacha20poly1305".into();
        assert!(matches!(
            bob.decrypt(&env, &a.public_key),
            Err(MeshError::Malformed(_))
        ));
    }

    #[test]
    fn test_sign_verify_requires_same_key() {
        let (alice, _bob, a, _b) = pair();
        let sig = alice.sign(b"payload");

        assert!(alice.verify(b"payload", &sig, &a.private_key));
        assert!(!alice.verify(b"payload", &sig, &a.public_key));
        assert!(!alice.verify(b"other", &sig, &a.private_key));
    }

    #[test]
    fn test_hash() {
        let (alice, _, _, _) = pair();
        assert_eq!(alice.hash(b"abc"), sha256_hex(b"abc"));
    }
}
