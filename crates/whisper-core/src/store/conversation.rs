//! Conversation threads and their summaries

use serde::{Deserialize, Serialize};

use super::message::Message;

/// Canonical key for the unordered pair `{a, b}`.
///
/// ```
/// use whisper_core::store::conversation_key;
/// assert_eq!(conversation_key("bbb", "aaa"), conversation_key("aaa", "bbb"));
/// assert_eq!(conversation_key("bbb", "aaa"), "aaa:bbb");
/// ```
pub fn conversation_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

/// The other participant of a message, seen from `local_id`.
pub(crate) fn other_party<'a>(local_id: &str, from: &'a str, to: &'a str) -> &'a str {
    if from == local_id {
        to
    } else {
        from
    }
}

/// Message history between the local node and one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub peer_id: String,
    /// Messages ordered by timestamp, ties in insertion order
    messages: Vec<Message>,
    /// Timestamp of the most recent message in either direction
    pub last_updated: i64,
    /// Messages from the peer at or before this time count as read
    #[serde(default)]
    pub last_read: i64,
}

impl Conversation {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            messages: Vec::new(),
            last_updated: 0,
            last_read: 0,
        }
    }

    /// Insert a message in timestamp order.
    ///
    /// Returns `false` if a message with the same id is already present.
    pub fn push(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        if message.timestamp > self.last_updated {
            self.last_updated = message.timestamp;
        }
        let pos = self
            .messages
            .iter()
            .position(|m| m.timestamp > message.timestamp)
            .unwrap_or(self.messages.len());
        self.messages.insert(pos, message);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Messages from the peer newer than `last_read`.
    pub fn unread_count(&self, local_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_from(local_id) && m.timestamp > self.last_read)
            .count()
    }

    /// Mark everything up to now (or the newest message) as read.
    pub fn mark_read(&mut self, now: i64) {
        self.last_read = now.max(self.last_updated);
    }

    pub(crate) fn summarize(&self, key: &str, local_id: &str) -> ConversationSummary {
        let last = self.last_message();
        ConversationSummary {
            key: key.to_string(),
            peer_id: self.peer_id.clone(),
            preview: last.map(crate::query::preview).unwrap_or_default(),
            last_message: last.cloned(),
            last_updated: self.last_updated,
            last_from_me: last.map(|m| m.is_from(local_id)).unwrap_or(false),
            unread_count: self.unread_count(local_id),
            message_count: self.messages.len(),
        }
    }
}

/// One row of a conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Canonical conversation key
    pub key: String,
    pub peer_id: String,
    pub last_message: Option<Message>,
    /// Short display text for the last message
    pub preview: String,
    pub last_updated: i64,
    pub last_from_me: bool,
    pub unread_count: usize,
    pub message_count: usize,
}
