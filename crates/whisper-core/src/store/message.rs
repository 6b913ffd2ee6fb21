//! Stored message form

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DEFAULT_TTL;
use crate::packet::Packet;

/// A message as kept in a conversation.
///
/// Unlike a [`Packet`] it always has a resolved local context, and once
/// stored it never changes. Delivery state lives in a separate set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id; equals the packet id for messages that came off the mesh
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: Value,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
    /// Hop budget when the message entered this store.
    ///
    /// For local sends that is the creation budget. The wire carries only the
    /// remaining budget, so a received message records the ttl it arrived with.
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    #[serde(default)]
    pub encrypted: bool,
}

fn default_ttl() -> u32 {
    DEFAULT_TTL
}

impl Message {
    /// Build the stored form of a packet.
    pub fn from_packet(packet: &Packet, encrypted: bool) -> Self {
        Self {
            id: packet.id().to_string(),
            from: packet.sender().to_string(),
            to: packet.recipient().as_str().to_string(),
            payload: packet.payload().clone(),
            timestamp: packet.timestamp(),
            ttl: packet.ttl().get(),
            encrypted,
        }
    }

    /// The `text` field of the payload, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    pub fn is_from(&self, id: &str) -> bool {
        self.from == id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use serde_json::json;

    #[test]
    fn test_from_packet_keeps_id() {
        let packet =
            Packet::create("aaa111", "bbb222", PacketType::Text, json!({"text": "hi"}), 3).unwrap();
        let message = Message::from_packet(&packet, false);

        assert_eq!(message.id, packet.id());
        assert_eq!(message.to, "bbb222");
        assert_eq!(message.ttl, 3);
        assert_eq!(message.text(), Some("hi"));
        assert!(message.is_from("aaa111"));
    }

    #[test]
    fn test_received_message_records_arrival_ttl() {
        let packet =
            Packet::create("aaa111", "bbb222", PacketType::Text, json!({"text": "hi"}), 3).unwrap();
        let arrived = packet.relayed().unwrap().relayed().unwrap();

        let message = Message::from_packet(&arrived, false);
        assert_eq!(message.ttl, 1);
        assert_eq!(message.id, packet.id());
    }

    #[test]
    fn test_decodes_record_without_optional_fields() {
        let raw = r#"{"id":"m1","from":"a","to":"b","timestamp":5}"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert_eq!(message.ttl, DEFAULT_TTL);
        assert!(!message.encrypted);
        assert!(message.payload.is_null());
        assert_eq!(message.text(), None);
    }
}
