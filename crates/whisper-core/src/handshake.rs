//! Link hello frame and inbound frame classification
//!
//! When a link opens each side sends one hello frame:
//!
//! ```text
//! {"protocol":"whisper/1","id":"…","name":"Whisper-Fox","publicKey":"…","ts":1705…}
//! ```
//!
//! Hello frames share the link with packet frames; the `protocol` field is
//! what tells them apart.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, MeshResult};
use crate::packet::Packet;

/// Protocol tag carried by every hello frame.
pub const PROTOCOL: &str = "whisper/1";

/// Hello frame exchanged on link open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub protocol: String,
    /// Sender's identity id
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Sender's hex public key; empty when unknown
    #[serde(default)]
    pub public_key: String,
    /// Unix timestamp in milliseconds
    pub ts: i64,
}

impl Handshake {
    pub fn new(id: impl Into<String>, name: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            id: id.into(),
            name: name.into(),
            public_key: public_key.into(),
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> MeshResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    fn from_value(value: Value) -> MeshResult<Self> {
        let hello: Handshake = serde_json::from_value(value)
            .map_err(|e| MeshError::Handshake(format!("unreadable hello: {}", e)))?;
        if hello.protocol != PROTOCOL {
            return Err(MeshError::Handshake(format!(
                "unsupported protocol {:?}",
                hello.protocol
            )));
        }
        if hello.id.is_empty() {
            return Err(MeshError::Handshake("hello without id".into()));
        }
        Ok(hello)
    }

    /// Decode a hello frame, rejecting other protocol tags.
    pub fn decode(frame: &[u8]) -> MeshResult<Self> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| MeshError::Handshake(format!("unreadable hello: {}", e)))?;
        Self::from_value(value)
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Handshake),
    Packet(Packet),
}

impl Frame {
    /// Classify and decode a raw frame.
    pub fn decode(frame: &[u8]) -> MeshResult<Self> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| MeshError::Malformed(format!("frame is not JSON: {}", e)))?;
        if value.get("protocol").is_some() {
            return Handshake::from_value(value).map(Frame::Hello);
        }
        Packet::from_wire(frame).map(Frame::Packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[test]
    fn test_hello_roundtrip() {
        let hello = Handshake::new("aaa111", "Whisper-Fox", "ab".repeat(32));
        let decoded = Handshake::decode(&hello.encode().unwrap()).unwrap();
        assert_eq!(decoded, hello);
    }

    #[test]
    fn test_wire_field_names() {
        let hello = Handshake::new("aaa111", "Whisper-Fox", "pk");
        let value: Value = serde_json::from_slice(&hello.encode().unwrap()).unwrap();
        assert_eq!(value["protocol"], "whisper/1");
        assert_eq!(value["publicKey"], "pk");
        assert!(value["ts"].is_i64());
    }

    #[test]
    fn test_other_protocol_rejected() {
        let frame = br#"{"protocol":"whisper/2","id":"aaa111","ts":1}"#;
        assert!(matches!(
            Handshake::decode(frame),
            Err(MeshError::Handshake(_))
        ));
    }

    #[test]
    fn test_minimal_hello_accepted() {
        let frame = br#"{"protocol":"whisper/1","id":"aaa111","ts":1}"#;
        let hello = Handshake::decode(frame).unwrap();
        assert_eq!(hello.id, "aaa111");
        assert!(hello.public_key.is_empty());
    }

    #[test]
    fn test_frame_classification() {
        let hello = Handshake::new("aaa111", "Whisper-Fox", "");
        assert!(matches!(
            Frame::decode(&hello.encode().unwrap()).unwrap(),
            Frame::Hello(_)
        ));

        let packet =
            Packet::create("aaa111", "*", PacketType::Text, serde_json::json!({}), 1).unwrap();
        assert_eq!(
            Frame::decode(&packet.to_wire().unwrap()).unwrap(),
            Frame::Packet(packet)
        );

        assert!(matches!(
            Frame::decode(b"\x00\x01"),
            Err(MeshError::Malformed(_))
        ));
    }
}
