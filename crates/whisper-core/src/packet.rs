//! The immutable envelope exchanged between nodes
//!
//! ## Wire Format
//!
//! Packets travel as JSON objects:
//!
//! ```text
//! {
//!   "id": "6f1c…",          // uuid v4, unique per packet
//!   "from": "aaa111",       // sender identity
//!   "to": "bbb222" | "*",   // recipient identity or broadcast
//!   "ttl": 4,               // remaining hop budget, >= 0
//!   "timestamp": 1705…,     // creation time, unix ms
//!   "type": "TEXT",         // TEXT | VOICE_START | VOICE_END | …
//!   "payload": { … }        // opaque JSON
//! }
//! ```
//!
//! Unknown `type` values decode as [`PacketType::Other`] carrying the raw tag,
//! so a relay forwards an extension type exactly as it received it.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::config::DEFAULT_TTL;
use crate::error::{MeshError, MeshResult};

/// Recipient marker for broadcast packets.
pub const BROADCAST: &str = "*";

/// Who a packet is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// Every node (`"*"` on the wire)
    Broadcast,
    /// A single node id
    Node(String),
}

impl Recipient {
    /// Build a recipient from a wire string.
    pub fn parse(value: &str) -> Self {
        if value == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Node(value.to_string())
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }

    /// Whether a node with `local_id` should deliver this packet.
    pub fn includes(&self, local_id: &str) -> bool {
        match self {
            Recipient::Broadcast => true,
            Recipient::Node(id) => id == local_id,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Broadcast => BROADCAST,
            Recipient::Node(id) => id,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Recipient {
    fn from(value: &str) -> Self {
        Recipient::parse(value)
    }
}

impl Serialize for Recipient {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        if value.is_empty() {
            return Err(serde::de::Error::custom("recipient must not be empty"));
        }
        Ok(Recipient::parse(&value))
    }
}

/// Remaining hop budget. Never negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ttl(u32);

impl Ttl {
    /// Validate a caller-supplied hop budget.
    ///
    /// Negative values are a programming error and are rejected, not clamped.
    pub fn new(value: i64) -> MeshResult<Self> {
        u32::try_from(value)
            .map(Ttl)
            .map_err(|_| MeshError::InvalidTtl(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// One hop less, or `None` when the budget is spent.
    pub fn decremented(self) -> Option<Ttl> {
        self.0.checked_sub(1).map(Ttl)
    }

    pub fn is_exhausted(self) -> bool {
        self.0 == 0
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Ttl(DEFAULT_TTL)
    }
}

impl From<u32> for Ttl {
    fn from(value: u32) -> Self {
        Ttl(value)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PacketType {
    Text,
    VoiceStart,
    VoiceEnd,
    /// Any type this build does not know. Relayed with its tag unchanged.
    Other(String),
}

impl PacketType {
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::Text => "TEXT",
            PacketType::VoiceStart => "VOICE_START",
            PacketType::VoiceEnd => "VOICE_END",
            PacketType::Other(tag) => tag,
        }
    }

    /// Build a packet type from a wire tag.
    pub fn parse(tag: &str) -> Self {
        match tag {
            "TEXT" => PacketType::Text,
            "VOICE_START" => PacketType::VoiceStart,
            "VOICE_END" => PacketType::VoiceEnd,
            other => PacketType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PacketType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PacketType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        if tag.is_empty() {
            return Err(serde::de::Error::custom("packet type must not be empty"));
        }
        Ok(PacketType::parse(&tag))
    }
}

/// A mesh packet.
///
/// Fields are read-only. Relaying produces a new value through
/// [`Packet::relayed`], so a packet that is still referenced elsewhere (the
/// store, a pending outbox, another relay attempt) is never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    id: String,
    from: String,
    to: Recipient,
    ttl: Ttl,
    timestamp: i64,
    #[serde(rename = "type")]
    kind: PacketType,
    #[serde(default)]
    payload: Value,
}

impl Packet {
    /// Stamp a new packet with a fresh id and the current time.
    ///
    /// # Arguments
    ///
    /// * `from` - Local identity id
    /// * `to` - Recipient or broadcast
    /// * `kind` - Packet type
    /// * `payload` - Opaque JSON payload
    /// * `ttl` - Hop budget; negative values fail with [`MeshError::InvalidTtl`]
    pub fn create(
        from: impl Into<String>,
        to: impl Into<Recipient>,
        kind: PacketType,
        payload: Value,
        ttl: i64,
    ) -> MeshResult<Self> {
        let from = from.into();
        if from.is_empty() {
            return Err(MeshError::MissingIdentity);
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            from,
            to: to.into(),
            ttl: Ttl::new(ttl)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
            payload,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn recipient(&self) -> &Recipient {
        &self.to
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn kind(&self) -> &PacketType {
        &self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Copy of this packet with one hop less, `None` when ttl is zero.
    pub fn relayed(&self) -> Option<Packet> {
        let ttl = self.ttl.decremented()?;
        Some(Packet {
            ttl,
            ..self.clone()
        })
    }

    /// Serialize for the wire.
    pub fn to_wire(&self) -> MeshResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a wire frame.
    ///
    /// Undecodable frames, missing fields, empty ids and negative ttl values
    /// are all [`MeshError::Malformed`].
    pub fn from_wire(frame: &[u8]) -> MeshResult<Self> {
        let packet: Packet = serde_json::from_slice(frame)
            .map_err(|e| MeshError::Malformed(format!("packet: {}", e)))?;
        if packet.id.is_empty() {
            return Err(MeshError::Malformed("packet id is empty".into()));
        }
        if packet.from.is_empty() {
            return Err(MeshError::Malformed("packet sender is empty".into()));
        }
        Ok(packet)
    }
}
