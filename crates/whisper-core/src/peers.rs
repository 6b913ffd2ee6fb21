//! Peer directory
//!
//! Remembers every peer learned from a hello frame: its name, public key and
//! when it was last heard from. Which peers are *currently* linked is only
//! kept in memory; the rest is persisted under [`keys::PEERS`] so public keys
//! survive restarts and encrypted text can be sent to a peer that is reached
//! over several hops.
//!
//! [`PeerDirectory::reachable`] is the allow-list handed to the conversation
//! query layer.
//!
//! [`keys::PEERS`]: crate::storage::keys::PEERS

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::MeshResult;
use crate::handshake::Handshake;
use crate::storage::{bounded, keys, KvStore};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Information about a known peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Hex public key, if the peer announced one
    #[serde(default)]
    pub public_key: Option<String>,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub last_seen: i64,
    /// Currently reachable over a direct link
    #[serde(skip)]
    pub linked: bool,
}

impl PeerInfo {
    /// Name for listings, falling back to a short id.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            crate::query::short_id(&self.id).to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Default)]
struct DirectoryState {
    peers: HashMap<String, PeerInfo>,
    /// link label -> peer id
    links: HashMap<String, String>,
}

/// Known peers and the links they are reachable on.
pub struct PeerDirectory {
    state: RwLock<DirectoryState>,
    kv: Arc<dyn KvStore>,
    timeout: Duration,
}

impl PeerDirectory {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            kv,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Load persisted peers. An unreadable record is logged and ignored.
    pub async fn load(&self) {
        let raw = match bounded(self.timeout, "peer load", self.kv.get(keys::PEERS)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Peer store unavailable");
                return;
            }
        };
        match serde_json::from_str::<Vec<PeerInfo>>(&raw) {
            Ok(list) => {
                let mut state = self.state.write();
                for peer in list {
                    state.peers.entry(peer.id.clone()).or_insert(peer);
                }
                tracing::debug!(count = state.peers.len(), "Loaded peers");
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable peer record"),
        }
    }

    /// Record a hello received on `link`. Returns the updated peer.
    pub async fn observe(&self, hello: &Handshake, link: &str) -> PeerInfo {
        let info = {
            let mut state = self.state.write();
            let peer = state
                .peers
                .entry(hello.id.clone())
                .or_insert_with(|| PeerInfo {
                    id: hello.id.clone(),
                    name: String::new(),
                    public_key: None,
                    last_seen: 0,
                    linked: false,
                });
            if !hello.name.is_empty() {
                peer.name = hello.name.clone();
            }
            if !hello.public_key.is_empty() {
                peer.public_key = Some(hello.public_key.clone());
            }
            peer.last_seen = chrono::Utc::now().timestamp_millis();
            peer.linked = true;
            let info = peer.clone();
            state.links.insert(link.to_string(), hello.id.clone());
            info
        };

        tracing::info!(peer = %info.id, name = %info.name, link = %link, "Peer linked");
        self.persist().await;
        info
    }

    /// Forget a link. The peer stays known but is unlinked once no other
    /// link points to it. Returns the peer id that was on the link.
    pub fn link_down(&self, link: &str) -> Option<String> {
        let mut state = self.state.write();
        let peer_id = state.links.remove(link)?;
        let still_linked = state.links.values().any(|id| id == &peer_id);
        if !still_linked {
            if let Some(peer) = state.peers.get_mut(&peer_id) {
                peer.linked = false;
            }
        }
        tracing::info!(peer = %peer_id, link = %link, "Link down");
        Some(peer_id)
    }

    /// Peer id behind a link label, if the hello has been seen.
    pub fn peer_on_link(&self, link: &str) -> Option<String> {
        self.state.read().links.get(link).cloned()
    }

    /// Update `last_seen` for a peer heard from indirectly.
    pub fn touch(&self, id: &str) {
        if let Some(peer) = self.state.write().peers.get_mut(id) {
            peer.last_seen = chrono::Utc::now().timestamp_millis();
        }
    }

    pub fn get(&self, id: &str) -> Option<PeerInfo> {
        self.state.read().peers.get(id).cloned()
    }

    pub fn public_key(&self, id: &str) -> Option<String> {
        self.state
            .read()
            .peers
            .get(id)
            .and_then(|p| p.public_key.clone())
    }

    /// All known peers, most recently seen first.
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.state.read().peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    /// Ids of peers on a direct link right now.
    pub fn reachable(&self) -> HashSet<String> {
        self.state
            .read()
            .peers
            .values()
            .filter(|p| p.linked)
            .map(|p| p.id.clone())
            .collect()
    }

    async fn persist(&self) {
        let list: Vec<PeerInfo> = self.state.read().peers.values().cloned().collect();
        let json = match serde_json::to_string(&list) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode peers");
                return;
            }
        };
        if let Err(e) = bounded(self.timeout, "peer save", self.kv.set(keys::PEERS, &json)).await {
            tracing::warn!(error = %e, "Failed to persist peers");
        }
    }
}
