//! Mesh node
//!
//! [`MeshNode`] owns one instance of every collaborator and wires them
//! together:
//!
//! ```text
//!   links ──frames──▶ inbox ──▶ handle_frame
//!                                  ├─ hello  ──▶ PeerDirectory
//!                                  └─ packet ──▶ MeshRouter ──┬─ deliver ──▶ MessageStore
//!                                                             │              └▶ NodeEvent
//!                                                             └─ relay ───▶ FanoutTransport ──▶ links
//! ```
//!
//! Nothing here is global. A node is opened over a [`KvStore`], links are
//! attached with [`MeshNode::link_up`], the inbox loop is started with
//! [`MeshNode::spawn`], and [`MeshNode::shutdown`] persists the seen-set.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use whisper_core::{MeshNode, NodeConfig};
//! use whisper_core::storage::MemoryKv;
//!
//! let node = Arc::new(MeshNode::open(Arc::new(MemoryKv::new()), NodeConfig::default()).await?);
//! let _inbox = node.spawn();
//! let mut events = node.subscribe_events();
//!
//! node.broadcast_text("anyone out there?").await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::cipher::{CipherEngine, EncryptedEnvelope, KeystreamCipher, SealedCipher};
use crate::config::{CipherSuite, NodeConfig};
use crate::error::{MeshError, MeshResult};
use crate::handshake::{Frame, Handshake};
use crate::identity::{Identity, IdentityProvider, KeyManager};
use crate::packet::{Packet, PacketType, Recipient};
use crate::peers::{PeerDirectory, PeerInfo};
use crate::query;
use crate::router::{MeshRouter, Route};
use crate::storage::{bounded, keys, KvStore};
use crate::store::{ConversationSummary, Message, MessageStore};
use crate::tcp::TcpLink;
use crate::transport::{FanoutTransport, InboundFrame, Link, SendReport};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const INBOX_CAPACITY: usize = 1024;

/// Something that happened on the mesh that a user interface cares about.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A text packet addressed here (or broadcast) was stored
    MessageReceived {
        message: Message,
        /// Plaintext, when the payload was readable
        text: Option<String>,
    },
    /// An encrypted packet addressed here could not be opened
    DecryptFailed {
        packet_id: String,
        from: String,
        error: String,
    },
    /// A peer started a voice session
    VoiceStart { packet_id: String, from: String },
    /// A peer ended a voice session
    VoiceEnd { packet_id: String, from: String },
    /// A hello arrived on a link
    PeerLinked { peer: PeerInfo, link: String },
    /// A link with a known peer went away
    PeerUnlinked { peer_id: String, link: String },
}

/// Result of sending a locally composed packet.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub packet_id: String,
    /// Stored form, for text
    pub message: Option<Message>,
    pub report: SendReport,
    /// No neighbor took the packet; it waits in the pending outbox
    pub queued: bool,
}

/// One participant of the mesh.
pub struct MeshNode {
    identity: Identity,
    config: NodeConfig,
    kv: Arc<dyn KvStore>,
    cipher: Arc<dyn CipherEngine>,
    store: MessageStore,
    router: MeshRouter,
    transport: Arc<FanoutTransport>,
    peers: PeerDirectory,
    event_tx: broadcast::Sender<NodeEvent>,
    inbox_tx: mpsc::Sender<InboundFrame>,
    inbox_rx: parking_lot::Mutex<Option<mpsc::Receiver<InboundFrame>>>,
}

impl MeshNode {
    /// Open a node over a persistence collaborator.
    ///
    /// This will:
    /// - Load or create the local identity and key pair
    /// - Open the message store and peer directory
    /// - Restore the persisted seen-set
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::KeyCorrupted`] if the stored key pair fails
    /// validation, or [`MeshError::Malformed`] for an unreadable identity.
    /// An unreachable store is not an error; the node runs from memory.
    pub async fn open(kv: Arc<dyn KvStore>, config: NodeConfig) -> MeshResult<Self> {
        let timeout = config.persistence_timeout;

        let identity = IdentityProvider::new(kv.clone())
            .with_display_name(config.display_name.clone())
            .with_timeout(timeout)
            .get_or_create()
            .await?;
        let keys = KeyManager::new(kv.clone())
            .with_timeout(timeout)
            .get_or_create()
            .await?;

        let cipher: Arc<dyn CipherEngine> = match config.cipher_suite {
            CipherSuite::Keystream => Arc::new(KeystreamCipher::new(keys)),
            CipherSuite::Sealed => Arc::new(SealedCipher::new(keys)),
        };

        let store = MessageStore::open_with_timeout(kv.clone(), identity.id.clone(), timeout).await;
        let peers = PeerDirectory::new(kv.clone()).with_timeout(timeout);
        peers.load().await;

        let transport = Arc::new(FanoutTransport::new(config.send_timeout));
        let router = MeshRouter::new(
            identity.id.clone(),
            transport.clone(),
            config.seen_capacity,
            config.relay_policy,
        );

        match bounded(timeout, "seen load", kv.get(keys::SEEN)).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(ids) => router.restore_seen(ids),
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable seen-set"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Seen-set unavailable, starting empty"),
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        tracing::info!(
            id = %identity.short_id(),
            name = %identity.name,
            cipher = cipher.algorithm(),
            seen = router.seen_len(),
            "Mesh node opened"
        );

        Ok(Self {
            identity,
            config,
            kv,
            cipher,
            store,
            router,
            transport,
            peers,
            event_tx,
            inbox_tx,
            inbox_rx: parking_lot::Mutex::new(Some(inbox_rx)),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Hex public key announced in hello frames.
    pub fn public_key(&self) -> &str {
        self.cipher.local_public_key()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn router(&self) -> &MeshRouter {
        &self.router
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn cipher(&self) -> &Arc<dyn CipherEngine> {
        &self.cipher
    }

    /// Labels of the links currently attached.
    pub fn links(&self) -> Vec<String> {
        self.transport.link_labels()
    }

    /// Sender half of the inbox, for links to deliver frames into.
    pub fn inbox(&self) -> mpsc::Sender<InboundFrame> {
        self.inbox_tx.clone()
    }

    /// Subscribe to node events. Slow receivers may miss events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: NodeEvent) {
        // no receivers is fine
        let _ = self.event_tx.send(event);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send text to one peer, or to everyone with `*`.
    ///
    /// Addressed text is encrypted when `encrypt_direct` is set and the
    /// recipient's public key is known; otherwise it travels as
    /// `{"text": …}`. The message is stored before it is flooded.
    pub async fn send_text(&self, to: &str, text: &str) -> MeshResult<SendOutcome> {
        if to.is_empty() {
            return Err(MeshError::Malformed("recipient must not be empty".into()));
        }
        let recipient = Recipient::parse(to);

        let peer_key = match &recipient {
            Recipient::Node(id) if self.config.encrypt_direct => self.peers.public_key(id),
            _ => None,
        };
        let (payload, encrypted) = match peer_key {
            Some(key) => {
                let envelope = self.cipher.encrypt(text.as_bytes(), &key)?;
                (envelope.to_value(), true)
            }
            None => (json!({ "text": text }), false),
        };

        let packet = Packet::create(
            &self.identity.id,
            recipient.as_str(),
            PacketType::Text,
            payload,
            i64::from(self.config.default_ttl),
        )?;
        let message = self.store.record_packet(&packet, encrypted).await;

        let mut outcome = self.dispatch(packet).await;
        outcome.message = message;
        Ok(outcome)
    }

    /// Send text to every node in range of the flood.
    pub async fn broadcast_text(&self, text: &str) -> MeshResult<SendOutcome> {
        self.send_text(crate::packet::BROADCAST, text).await
    }

    /// Signal the start of a voice session.
    pub async fn send_voice_start(&self, to: &str) -> MeshResult<SendOutcome> {
        self.send_signal(to, PacketType::VoiceStart).await
    }

    /// Signal the end of a voice session.
    pub async fn send_voice_end(&self, to: &str) -> MeshResult<SendOutcome> {
        self.send_signal(to, PacketType::VoiceEnd).await
    }

    async fn send_signal(&self, to: &str, kind: PacketType) -> MeshResult<SendOutcome> {
        let packet = Packet::create(
            &self.identity.id,
            to,
            kind,
            json!({ "name": self.identity.name }),
            i64::from(self.config.default_ttl),
        )?;
        Ok(self.dispatch(packet).await)
    }

    /// Flood a packet; queue it when no neighbor accepted it.
    async fn dispatch(&self, packet: Packet) -> SendOutcome {
        let report = self.router.originate(&packet).await;
        let queued = !report.any_delivered();
        let packet_id = packet.id().to_string();
        if queued {
            tracing::debug!(packet_id = %packet_id, "No neighbor reached, queued");
            self.store.add_pending(packet).await;
        }
        SendOutcome {
            packet_id,
            message: None,
            report,
            queued,
        }
    }

    /// Re-send queued packets. Returns how many reached a neighbor.
    pub async fn flush_pending(&self) -> usize {
        let mut sent = 0;
        for packet in self.store.pending() {
            let report = self.router.resend(&packet).await;
            if report.any_delivered() {
                self.store.remove_pending(packet.id()).await;
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::info!(sent, "Flushed pending outbox");
        }
        sent
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving
    // ═══════════════════════════════════════════════════════════════════════

    /// Process one frame from a link.
    ///
    /// Returns the routing decision for packet frames and `None` for hellos.
    pub async fn handle_frame(&self, frame: InboundFrame) -> MeshResult<Option<Route>> {
        match Frame::decode(&frame.data)? {
            Frame::Hello(hello) => {
                let peer = self.peers.observe(&hello, &frame.link).await;
                self.emit(NodeEvent::PeerLinked {
                    peer,
                    link: frame.link,
                });
                Ok(None)
            }
            Frame::Packet(packet) => Ok(Some(self.handle_packet(&packet).await)),
        }
    }

    /// Route a decoded packet: deliver here, then relay onward.
    pub async fn handle_packet(&self, packet: &Packet) -> Route {
        self.peers.touch(packet.sender());

        let route = self.router.accept(packet);
        if route.delivers() {
            self.deliver(packet).await;
        }
        if let Some(next) = route.relay() {
            self.router.relay(next).await;
        }
        route
    }

    async fn deliver(&self, packet: &Packet) {
        match packet.kind() {
            PacketType::Text => self.deliver_text(packet).await,
            PacketType::VoiceStart => self.emit(NodeEvent::VoiceStart {
                packet_id: packet.id().to_string(),
                from: packet.sender().to_string(),
            }),
            PacketType::VoiceEnd => self.emit(NodeEvent::VoiceEnd {
                packet_id: packet.id().to_string(),
                from: packet.sender().to_string(),
            }),
            PacketType::Other(tag) => {
                tracing::debug!(packet_id = %packet.id(), kind = %tag, "Ignoring packet of unknown type");
            }
        }
    }

    async fn deliver_text(&self, packet: &Packet) {
        let envelope = EncryptedEnvelope::from_value(packet.payload()).ok();
        let encrypted = envelope.is_some();

        let Some(message) = self.store.record_packet(packet, encrypted).await else {
            return;
        };
        self.store.mark_delivered(&message.id).await;

        let text = match envelope {
            Some(envelope) => match self.open_envelope(&envelope, packet.sender()) {
                Ok(text) => Some(text),
                Err(e) => {
                    tracing::warn!(packet_id = %packet.id(), from = %packet.sender(), error = %e, "Could not decrypt message");
                    self.emit(NodeEvent::DecryptFailed {
                        packet_id: packet.id().to_string(),
                        from: packet.sender().to_string(),
                        error: e.to_string(),
                    });
                    None
                }
            },
            None => message.text().map(str::to_string),
        };

        tracing::info!(packet_id = %packet.id(), from = %query::short_id(packet.sender()), encrypted, "Message received");
        self.emit(NodeEvent::MessageReceived { message, text });
    }

    fn open_envelope(&self, envelope: &EncryptedEnvelope, peer_id: &str) -> MeshResult<String> {
        let key = self
            .peers
            .public_key(peer_id)
            .ok_or_else(|| MeshError::Crypto(format!("no public key for {}", peer_id)))?;
        self.cipher.decrypt(envelope, &key)?.text()
    }

    /// Readable text of a stored message.
    ///
    /// Encrypted messages are opened with the other participant's key; the
    /// derived key is the same in both directions, so sent messages open too.
    pub fn message_text(&self, message: &Message) -> MeshResult<Option<String>> {
        if !message.encrypted {
            return Ok(message.text().map(str::to_string));
        }
        let envelope = EncryptedEnvelope::from_value(&message.payload)?;
        let peer = if message.is_from(self.id()) {
            &message.to
        } else {
            &message.from
        };
        self.open_envelope(&envelope, peer).map(Some)
    }

    /// Conversation summaries newest first, optionally only with linked peers.
    pub fn conversations(&self, only_reachable: bool) -> Vec<ConversationSummary> {
        if only_reachable {
            let reachable = self.peers.reachable();
            query::list_conversations(&self.store, Some(&reachable))
        } else {
            query::list_conversations(&self.store, None)
        }
    }

    /// Take the inbox and process frames until every sender is gone.
    ///
    /// Only the first call gets the inbox; later calls return immediately.
    pub async fn run_inbox(&self) {
        let inbox = self.inbox_rx.lock().take();
        let Some(mut inbox) = inbox else {
            tracing::warn!("Inbox loop already running");
            return;
        };
        while let Some(frame) = inbox.recv().await {
            let link = frame.link.clone();
            if let Err(e) = self.handle_frame(frame).await {
                tracing::debug!(link = %link, error = %e, "Dropping frame");
            }
        }
        tracing::debug!("Inbox closed");
    }

    /// Run the inbox loop on a background task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run_inbox().await })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Links
    // ═══════════════════════════════════════════════════════════════════════

    /// Attach a link: register it, say hello on it, flush the outbox.
    pub async fn link_up(&self, link: Arc<dyn Link>) -> MeshResult<()> {
        let label = link.label().to_string();
        let hello = Handshake::new(&self.identity.id, &self.identity.name, self.public_key()).encode()?;

        self.transport.add_link(link.clone());
        if let Err(e) = link.send(hello).await {
            tracing::warn!(link = %label, error = %e, "Hello failed, dropping link");
            self.transport.remove_link(&label);
            return Err(e);
        }
        tracing::debug!(link = %label, "Link up");

        self.flush_pending().await;
        Ok(())
    }

    /// Detach a link and unlink the peer behind it.
    pub fn link_down(&self, label: &str) {
        self.transport.remove_link(label);
        if let Some(peer_id) = self.peers.link_down(label) {
            self.emit(NodeEvent::PeerUnlinked {
                peer_id,
                link: label.to_string(),
            });
        }
    }

    /// Attach an established TCP connection. The link is taken down when
    /// the remote side closes it.
    pub async fn attach_tcp(self: &Arc<Self>, stream: TcpStream) -> MeshResult<String> {
        let (link, reader) = TcpLink::spawn(stream, self.inbox())?;
        let label = link.label().to_string();
        self.link_up(link).await?;

        let node = Arc::downgrade(self);
        let watched = label.clone();
        tokio::spawn(async move {
            let _ = reader.await;
            if let Some(node) = node.upgrade() {
                node.link_down(&watched);
            }
        });
        Ok(label)
    }

    /// Dial a neighbor over TCP.
    pub async fn connect_tcp(self: &Arc<Self>, addr: SocketAddr) -> MeshResult<String> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Transport(format!("connect {}: {}", addr, e)))?;
        self.attach_tcp(stream).await
    }

    /// Accept neighbors forever.
    pub async fn serve_tcp(self: &Arc<Self>, listener: TcpListener) -> MeshResult<()> {
        tracing::info!(addr = %listener.local_addr()?, "Listening for neighbors");
        loop {
            let (stream, addr) = listener.accept().await?;
            match self.attach_tcp(stream).await {
                Ok(label) => tracing::info!(link = %label, "Neighbor connected"),
                Err(e) => tracing::warn!(%addr, error = %e, "Neighbor rejected"),
            }
        }
    }

    /// Persist the seen-set so a restart does not re-deliver recent packets.
    pub async fn shutdown(&self) -> MeshResult<()> {
        let seen = serde_json::to_string(&self.router.snapshot_seen())?;
        let timeout = self.config.persistence_timeout;
        if let Err(e) = bounded(timeout, "seen save", self.kv.set(keys::SEEN, &seen)).await {
            tracing::warn!(error = %e, "Failed to persist seen-set");
        }
        for label in self.transport.link_labels() {
            self.link_down(&label);
        }
        tracing::info!(id = %self.identity.short_id(), "Mesh node shut down");
        Ok(())
    }
}
