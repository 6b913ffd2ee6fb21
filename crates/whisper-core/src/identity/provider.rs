//! Stable local node identity

use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{MeshError, MeshResult};
use crate::storage::{bounded, keys, KvStore};

const ANIMALS: [&str; 6] = ["Fox", "Otter", "Wolf", "Hawk", "Raven", "Tiger"];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The local node identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Opaque stable id (64 hex chars, 256 bits)
    pub id: String,
    /// Display name shown to peers in the handshake
    #[serde(default)]
    pub name: String,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub created_at: i64,
}

impl Identity {
    fn generate(name: Option<String>) -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        let id = blake3::hash(&seed).to_hex().to_string();

        let name = name.unwrap_or_else(|| {
            let animal = ANIMALS[rand::rng().random_range(0..ANIMALS.len())];
            format!("Whisper-{}", animal)
        });

        Self {
            id,
            name,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Last eight characters of the id, for logs and listings.
    pub fn short_id(&self) -> &str {
        crate::query::short_id(&self.id)
    }
}

/// Produces and persists the local [`Identity`].
///
/// The generated identity is memoized behind an async mutex; the first
/// caller generates and persists while concurrent callers wait and then
/// receive the same value.
pub struct IdentityProvider {
    kv: Arc<dyn KvStore>,
    cached: Mutex<Option<Identity>>,
    display_name: Option<String>,
    timeout: Duration,
}

impl IdentityProvider {
    /// Create a provider over the given persistence collaborator.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cached: Mutex::new(None),
            display_name: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use this name instead of a generated one when creating the identity.
    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    /// Set the upper bound on each persistence call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Return the persisted identity, creating it on first access.
    ///
    /// A persisted record that fails to decode is a structural error. An
    /// unreachable store degrades to an in-memory identity for this process.
    pub async fn get_or_create(&self) -> MeshResult<Identity> {
        let mut cached = self.cached.lock().await;
        self.load_or_create(&mut cached).await
    }

    /// Caller holds the `cached` lock for the whole call.
    async fn load_or_create(&self, cached: &mut Option<Identity>) -> MeshResult<Identity> {
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        match bounded(self.timeout, "identity load", self.kv.get(keys::IDENTITY)).await {
            Ok(Some(raw)) => {
                let identity: Identity = serde_json::from_str(&raw)
                    .map_err(|e| MeshError::Malformed(format!("identity record: {}", e)))?;
                if identity.id.is_empty() {
                    return Err(MeshError::Malformed("identity record has empty id".into()));
                }
                *cached = Some(identity.clone());
                return Ok(identity);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Identity store unavailable, using in-memory identity");
            }
        }

        let identity = Identity::generate(self.display_name.clone());
        self.persist(&identity).await;

        tracing::info!(id = %identity.short_id(), name = %identity.name, "Created local identity");
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// The identity if it has already been loaded or created.
    pub async fn current(&self) -> Option<Identity> {
        self.cached.lock().await.clone()
    }

    /// The loaded identity, or [`MeshError::MissingIdentity`].
    pub async fn require(&self) -> MeshResult<Identity> {
        self.current().await.ok_or(MeshError::MissingIdentity)
    }

    /// Change the display name and persist it.
    pub async fn rename(&self, name: impl Into<String>) -> MeshResult<Identity> {
        let mut cached = self.cached.lock().await;
        let mut identity = self.load_or_create(&mut cached).await?;
        identity.name = name.into();
        self.persist(&identity).await;
        *cached = Some(identity.clone());
        Ok(identity)
    }

    /// Delete the persisted identity. The next access generates a new one.
    pub async fn reset(&self) -> MeshResult<()> {
        let mut cached = self.cached.lock().await;
        bounded(self.timeout, "identity reset", self.kv.remove(keys::IDENTITY)).await?;
        *cached = None;
        tracing::warn!("Local identity reset");
        Ok(())
    }

    async fn persist(&self, identity: &Identity) {
        let json = match serde_json::to_string(identity) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode identity");
                return;
            }
        };
        if let Err(e) = bounded(self.timeout, "identity save", self.kv.set(keys::IDENTITY, &json)).await {
            tracing::warn!(error = %e, "Failed to persist identity");
        }
    }
}
