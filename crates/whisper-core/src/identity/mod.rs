//! Local node identity and key material
//!
//! ## Overview
//!
//! Two lazily-created records describe this installation:
//! - **Identity**: a stable opaque node id plus a human-friendly name
//! - **KeyPair**: the X25519 key pair used to derive per-peer cipher keys
//!
//! Both are created on first access, persisted through the [`KvStore`]
//! collaborator and memoized per process, so concurrent first calls observe
//! a single generated value.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use whisper_core::identity::{IdentityProvider, KeyManager};
//! use whisper_core::storage::MemoryKv;
//!
//! let kv = Arc::new(MemoryKv::new());
//! let identity = IdentityProvider::new(kv.clone()).get_or_create().await?;
//! let keys = KeyManager::new(kv).get_or_create().await?;
//! println!("{} ({})", identity.name, identity.short_id());
//! ```
//!
//! [`KvStore`]: crate::storage::KvStore

mod keypair;
mod provider;

pub use keypair::{KeyManager, KeyMetadata, KeyPair, KEY_HEX_LEN, KEY_LEN};
pub use provider::{Identity, IdentityProvider};
