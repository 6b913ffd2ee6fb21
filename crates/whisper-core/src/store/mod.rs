//! Per-conversation message store
//!
//! ## Overview
//!
//! Messages are grouped into conversations keyed by the unordered pair of
//! participants ([`conversation_key`]). The store keeps the full index in
//! memory and writes it through to the [`KvStore`] collaborator after every
//! mutation.
//!
//! ```text
//!   add_message / record_packet / mark_* / clear_*
//!                     │
//!          ┌──────────▼──────────┐   one writer at a time
//!          │  writer (async lock)│
//!          └──────────┬──────────┘
//!     mutate index ───┤  (sync lock, snapshot taken inside)
//!     persist  ───────┤  (write-through, failures degrade to memory)
//!     notify   ───────┘  (subscribers in registration order)
//! ```
//!
//! ## Guarantees
//!
//! - Mutations are serialized, so the last snapshot written is the latest one
//! - A subscriber only ever sees whole mutations (message appended *and*
//!   `last_updated` moved, or neither)
//! - Unsubscribing from inside a callback is safe; the removed subscriber is
//!   not called again
//! - Recording the same packet twice stores it once

mod conversation;
mod message;

pub use conversation::{conversation_key, Conversation, ConversationSummary};
pub use message::Message;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::config::DEFAULT_TTL;
use crate::error::{MeshError, MeshResult};
use crate::packet::{Packet, BROADCAST};
use crate::storage::{bounded, keys, KvStore};
use conversation::other_party;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Full store state handed to subscribers.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    /// Conversations by canonical key
    pub conversations: BTreeMap<String, Conversation>,
    pub delivered: HashSet<String>,
    pub pending: Vec<Packet>,
}

#[derive(Default)]
struct StoreState {
    conversations: BTreeMap<String, Conversation>,
    delivered: HashSet<String>,
    pending: Vec<Packet>,
}

impl StoreState {
    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            delivered: self.delivered.clone(),
            pending: self.pending.clone(),
        }
    }

    fn resolve_key(&self, local_id: &str, peer_or_key: &str) -> Option<String> {
        if self.conversations.contains_key(peer_or_key) {
            return Some(peer_or_key.to_string());
        }
        let direct = conversation_key(local_id, peer_or_key);
        if self.conversations.contains_key(&direct) {
            return Some(direct);
        }
        // The local id is part of every key, so only the peer side may match.
        self.conversations
            .iter()
            .find(|(_, conv)| conv.peer_id == peer_or_key)
            .map(|(key, _)| key.clone())
    }
}

/// Which persisted records a mutation touched.
#[derive(Clone, Copy)]
struct Dirty {
    conversations: bool,
    delivered: bool,
    pending: bool,
}

impl Dirty {
    const CONVERSATIONS: Dirty = Dirty {
        conversations: true,
        delivered: false,
        pending: false,
    };
    const DELIVERED: Dirty = Dirty {
        conversations: false,
        delivered: true,
        pending: false,
    };
    const PENDING: Dirty = Dirty {
        conversations: false,
        delivered: false,
        pending: true,
    };
    const ALL: Dirty = Dirty {
        conversations: true,
        delivered: true,
        pending: true,
    };
}

type Listener = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Listener,
}

#[derive(Default)]
struct Subscribers {
    list: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Handle returned by [`MessageStore::subscribe`].
#[must_use = "dropping the handle keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    /// Stop receiving notifications. Safe to call from inside the listener
    /// and more than once.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.list.lock().retain(|s| s.id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Durable, queryable message log grouped into conversations.
pub struct MessageStore {
    local_id: String,
    state: RwLock<StoreState>,
    writer: tokio::sync::Mutex<()>,
    subscribers: Arc<Subscribers>,
    kv: Arc<dyn KvStore>,
    timeout: Duration,
}

impl MessageStore {
    /// Open the store for `local_id`, loading any persisted state.
    ///
    /// An unreachable persistence collaborator or an unreadable record is
    /// logged and the store starts empty for that part.
    pub async fn open(kv: Arc<dyn KvStore>, local_id: impl Into<String>) -> Self {
        Self::open_with_timeout(kv, local_id, DEFAULT_TIMEOUT).await
    }

    /// [`MessageStore::open`] with an explicit persistence timeout.
    pub async fn open_with_timeout(
        kv: Arc<dyn KvStore>,
        local_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let store = Self {
            local_id: local_id.into(),
            state: RwLock::new(StoreState::default()),
            writer: tokio::sync::Mutex::new(()),
            subscribers: Arc::new(Subscribers::default()),
            kv,
            timeout,
        };

        let conversations: Option<BTreeMap<String, Conversation>> =
            store.load_record(keys::CONVERSATIONS).await;
        let delivered: Option<Vec<String>> = store.load_record(keys::DELIVERED).await;
        let pending: Option<Vec<Packet>> = store.load_record(keys::PENDING).await;

        {
            let mut state = store.state.write();
            state.conversations = conversations.unwrap_or_default();
            state.delivered = delivered.unwrap_or_default().into_iter().collect();
            state.pending = pending.unwrap_or_default();
            tracing::debug!(
                conversations = state.conversations.len(),
                delivered = state.delivered.len(),
                pending = state.pending.len(),
                "Message store opened"
            );
        }
        store
    }

    async fn load_record<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match bounded(self.timeout, "store load", self.kv.get(key)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Ignoring unreadable store record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Store load failed, starting empty");
                None
            }
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a locally composed message.
    ///
    /// # Arguments
    ///
    /// * `from` - Sender identity
    /// * `to` - Recipient identity (or `*`)
    /// * `payload` - Message payload
    /// * `encrypted` - Whether `payload` carries an encrypted envelope
    pub async fn add_message(
        &self,
        from: &str,
        to: &str,
        payload: Value,
        encrypted: bool,
    ) -> MeshResult<Message> {
        if from.is_empty() || to.is_empty() {
            return Err(MeshError::Malformed("message needs from and to".into()));
        }
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: to.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ttl: DEFAULT_TTL,
            encrypted,
        };
        self.insert(message.clone()).await;
        Ok(message)
    }

    /// Store a packet's content under its own id.
    ///
    /// Returns `None` when a message with that id is already stored, so a
    /// packet recorded twice (optimistic send, then echo) is kept once.
    pub async fn record_packet(&self, packet: &Packet, encrypted: bool) -> Option<Message> {
        let message = Message::from_packet(packet, encrypted);
        if self.insert(message.clone()).await {
            Some(message)
        } else {
            None
        }
    }

    async fn insert(&self, message: Message) -> bool {
        // every broadcast, sent or received, shares one channel
        let (key, peer) = if message.to == BROADCAST {
            (conversation_key(&self.local_id, BROADCAST), BROADCAST.to_string())
        } else {
            (
                conversation_key(&message.from, &message.to),
                other_party(&self.local_id, &message.from, &message.to).to_string(),
            )
        };
        let id = message.id.clone();

        let inserted = self
            .mutate(Dirty::CONVERSATIONS, |state| {
                state
                    .conversations
                    .entry(key.clone())
                    .or_insert_with(|| Conversation::new(peer.clone()))
                    .push(message)
            })
            .await;

        if inserted {
            tracing::debug!(message_id = %id, conversation = %key, "Message stored");
        } else {
            tracing::trace!(message_id = %id, "Message already stored");
        }
        inserted
    }

    /// Add a message id to the delivered set.
    pub async fn mark_delivered(&self, id: &str) {
        self.mutate(Dirty::DELIVERED, |state| state.delivered.insert(id.to_string()))
            .await;
    }

    /// Mark a conversation read. Returns `false` if there is no such conversation.
    pub async fn mark_conversation_read(&self, peer_or_key: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let local_id = self.local_id.clone();
        self.mutate(Dirty::CONVERSATIONS, |state| {
            match state.resolve_key(&local_id, peer_or_key) {
                Some(key) => state
                    .conversations
                    .get_mut(&key)
                    .map(|conv| conv.mark_read(now))
                    .is_some(),
                None => false,
            }
        })
        .await
    }

    /// Delete one conversation. Returns `false` if there was none.
    pub async fn clear_conversation(&self, peer_or_key: &str) -> bool {
        let local_id = self.local_id.clone();
        let removed = self
            .mutate(Dirty::CONVERSATIONS, |state| {
                state
                    .resolve_key(&local_id, peer_or_key)
                    .and_then(|key| state.conversations.remove(&key))
                    .is_some()
            })
            .await;
        if removed {
            tracing::info!(peer = %peer_or_key, "Conversation cleared");
        }
        removed
    }

    /// Delete every conversation, the delivered set and the pending outbox.
    pub async fn clear_all(&self) {
        self.mutate(Dirty::ALL, |state| {
            *state = StoreState::default();
        })
        .await;
        tracing::info!("Message store cleared");
    }

    /// Queue a packet that reached no neighbor.
    pub async fn add_pending(&self, packet: Packet) {
        self.mutate(Dirty::PENDING, |state| {
            if !state.pending.iter().any(|p| p.id() == packet.id()) {
                state.pending.push(packet);
            }
        })
        .await;
    }

    /// Drop a packet from the outbox after a neighbor accepted it.
    pub async fn remove_pending(&self, id: &str) -> bool {
        self.mutate(Dirty::PENDING, |state| {
            let before = state.pending.len();
            state.pending.retain(|p| p.id() != id);
            state.pending.len() != before
        })
        .await
    }

    /// Run one mutation: apply under the index lock, write through, notify.
    async fn mutate<R>(&self, dirty: Dirty, apply: impl FnOnce(&mut StoreState) -> R) -> R {
        let _writer = self.writer.lock().await;

        let (result, snapshot) = {
            let mut state = self.state.write();
            let result = apply(&mut *state);
            (result, state.snapshot())
        };

        self.persist(&snapshot, dirty).await;
        self.notify(&snapshot);
        result
    }

    async fn persist(&self, snapshot: &StoreSnapshot, dirty: Dirty) {
        if dirty.conversations {
            self.write_record(keys::CONVERSATIONS, &snapshot.conversations, snapshot.conversations.is_empty())
                .await;
        }
        if dirty.delivered {
            let delivered: Vec<&String> = snapshot.delivered.iter().collect();
            self.write_record(keys::DELIVERED, &delivered, delivered.is_empty())
                .await;
        }
        if dirty.pending {
            self.write_record(keys::PENDING, &snapshot.pending, snapshot.pending.is_empty())
                .await;
        }
    }

    async fn write_record<T: serde::Serialize + ?Sized>(&self, key: &str, value: &T, empty: bool) {
        let result = if empty {
            bounded(self.timeout, "store remove", self.kv.remove(key)).await
        } else {
            match serde_json::to_string(value) {
                Ok(json) => bounded(self.timeout, "store write", self.kv.set(key, &json)).await,
                Err(e) => Err(e.into()),
            }
        };
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "Persist failed, keeping change in memory only");
        }
    }

    fn notify(&self, snapshot: &StoreSnapshot) {
        let listeners: Vec<(Arc<AtomicBool>, Listener)> = self
            .subscribers
            .list
            .lock()
            .iter()
            .map(|s| (s.active.clone(), s.listener.clone()))
            .collect();

        for (active, listener) in listeners {
            if active.load(Ordering::SeqCst) {
                listener(snapshot);
            }
        }
    }

    /// Register a listener called with the full state after every mutation.
    ///
    /// Listeners run synchronously, in registration order, before the
    /// mutating call returns. They must not block.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreSnapshot) + Send + Sync + 'static,
    {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));
        self.subscribers.list.lock().push(Subscriber {
            id,
            active: active.clone(),
            listener: Arc::new(listener),
        });
        Subscription {
            id,
            active,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.list.lock().len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Messages with a peer (or by conversation key), oldest first.
    /// Unknown peers give an empty list.
    pub fn get_messages(&self, peer_or_key: &str) -> Vec<Message> {
        let state = self.state.read();
        state
            .resolve_key(&self.local_id, peer_or_key)
            .and_then(|key| state.conversations.get(&key))
            .map(|conv| conv.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn get_conversation(&self, peer_or_key: &str) -> Option<Conversation> {
        let state = self.state.read();
        state
            .resolve_key(&self.local_id, peer_or_key)
            .and_then(|key| state.conversations.get(&key).cloned())
    }

    /// One summary per conversation, in key order. Callers sort and filter.
    pub fn get_conversations(&self) -> Vec<ConversationSummary> {
        self.state
            .read()
            .conversations
            .iter()
            .map(|(key, conv)| conv.summarize(key, &self.local_id))
            .collect()
    }

    pub fn is_delivered(&self, id: &str) -> bool {
        self.state.read().delivered.contains(id)
    }

    /// Packets waiting for a neighbor, oldest first.
    pub fn pending(&self) -> Vec<Packet> {
        self.state.read().pending.clone()
    }

    /// Full current state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.read().snapshot()
    }
}
