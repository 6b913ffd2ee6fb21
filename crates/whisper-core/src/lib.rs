//! Whisper Core Library
//!
//! Offline text messaging over a flood-routed mesh of short-range links.
//!
//! ## Overview
//!
//! Whisper nodes talk to whoever is in range. A message addressed to a node
//! that is several hops away gets there because every node that hears it
//! passes it on once, until its hop budget runs out. Nothing depends on a
//! server or on the internet being reachable.
//!
//! ## Core Pieces
//!
//! - **Router**: dedupes by packet id, decides local delivery and relay
//! - **Store**: conversations persisted through a key/value collaborator
//! - **Cipher**: per-peer key derivation, encryption and integrity tags
//! - **Node**: wires the above to links and emits events
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use whisper_core::{MeshNode, NodeConfig, RedbKv};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let kv = Arc::new(RedbKv::open("~/.whisper/data/whisper.redb")?);
//!     let node = Arc::new(MeshNode::open(kv, NodeConfig::default()).await?);
//!     let _inbox = node.spawn();
//!
//!     node.connect_tcp("192.168.1.20:7420".parse()?).await?;
//!     node.broadcast_text("anyone nearby?").await?;
//!
//!     for summary in node.conversations(false) {
//!         println!("{} {}", summary.peer_id, summary.preview);
//!     }
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cipher;
pub mod config;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod node;
pub mod packet;
pub mod peers;
pub mod query;
pub mod router;
pub mod sim;
pub mod storage;
pub mod store;
pub mod tcp;
pub mod transport;

// Re-exports
pub use cipher::{CipherEngine, EncryptedEnvelope, KeystreamCipher, SealedCipher};
pub use config::{CipherSuite, NodeConfig, RelayPolicy, DEFAULT_TTL};
pub use error::{ErrorCategory, MeshError, MeshResult};
pub use handshake::{Frame, Handshake, PROTOCOL};
pub use identity::{Identity, IdentityProvider, KeyManager, KeyMetadata, KeyPair};
pub use node::{MeshNode, NodeEvent, SendOutcome};
pub use packet::{Packet, PacketType, Recipient, Ttl, BROADCAST};
pub use peers::{PeerDirectory, PeerInfo};
pub use router::{MeshRouter, Route, RouteOutcome};
pub use sim::{FloodReport, MeshSimulation, Topology};
pub use storage::{KvStore, MemoryKv, RedbKv};
pub use store::{Conversation, ConversationSummary, Message, MessageStore, StoreSnapshot, Subscription};
pub use transport::{ChannelLink, FanoutTransport, InboundFrame, Link, SendReport, Transport};
