//! Node configuration
//!
//! A plain struct with sensible defaults. The CLI fills it from command-line
//! flags; tests construct it directly and tweak individual fields.

use std::time::Duration;

/// Default hop budget stamped on new packets.
pub const DEFAULT_TTL: u32 = 4;

/// Default upper bound on remembered packet ids.
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Default per-neighbor send timeout.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(3);

/// Default timeout for a single key/value operation.
const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the router does with a packet addressed to this node once delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayPolicy {
    /// Relay whenever ttl > 0, regardless of local delivery (pure flood).
    #[default]
    AlwaysFlood,
    /// Stop relaying an addressed packet once it reached its recipient.
    /// Broadcast packets are still relayed.
    SuppressOnDelivery,
}

impl std::str::FromStr for RelayPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flood" | "always-flood" => Ok(RelayPolicy::AlwaysFlood),
            "suppress" | "suppress-on-delivery" => Ok(RelayPolicy::SuppressOnDelivery),
            other => Err(format!("unknown relay policy: {}", other)),
        }
    }
}

/// Which [`CipherEngine`](crate::cipher::CipherEngine) a node encrypts with.
///
/// Both ends of a conversation must use the same suite; an envelope tagged
/// with another algorithm fails to decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherSuite {
    /// SHA-256 keystream with a SHA-256 integrity tag
    #[default]
    Keystream,
    /// X25519 + HKDF + ChaCha20-Poly1305
    Sealed,
}

impl std::str::FromStr for CipherSuite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keystream" | "sha256" => Ok(CipherSuite::Keystream),
            "sealed" | "chacha" => Ok(CipherSuite::Sealed),
            other => Err(format!("unknown cipher suite: {}", other)),
        }
    }
}

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Hop budget for packets created by this node.
    pub default_ttl: u32,
    /// Maximum number of packet ids kept in the seen-set (LRU eviction).
    pub seen_capacity: usize,
    /// Relay behavior for addressed packets delivered here.
    pub relay_policy: RelayPolicy,
    /// Upper bound on a single neighbor send.
    pub send_timeout: Duration,
    /// Upper bound on a single persistence call.
    pub persistence_timeout: Duration,
    /// Encrypt addressed text when the recipient's public key is known.
    pub encrypt_direct: bool,
    /// Cipher used for addressed text.
    pub cipher_suite: CipherSuite,
    /// Name to use instead of a generated one when the identity is first created.
    pub display_name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            relay_policy: RelayPolicy::default(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
            encrypt_direct: true,
            cipher_suite: CipherSuite::default(),
            display_name: None,
        }
    }
}

impl NodeConfig {
    /// Set the default hop budget.
    pub fn with_default_ttl(mut self, ttl: u32) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the seen-set capacity. Zero is bumped to one.
    pub fn with_seen_capacity(mut self, capacity: usize) -> Self {
        self.seen_capacity = capacity.max(1);
        self
    }

    /// Set the relay policy for addressed packets.
    pub fn with_relay_policy(mut self, policy: RelayPolicy) -> Self {
        self.relay_policy = policy;
        self
    }

    /// Set the per-neighbor send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Set the persistence timeout.
    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }

    /// Enable or disable encryption of addressed text.
    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encrypt_direct = enabled;
        self
    }

    /// Choose the cipher suite.
    pub fn with_cipher_suite(mut self, suite: CipherSuite) -> Self {
        self.cipher_suite = suite;
        self
    }

    /// Set the display name used when the identity is first created.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}
