//! Flood router
//!
//! Per packet id the router knows two states, unseen and seen. The first
//! encounter of an id marks it seen and routes it; every later encounter is
//! a silent no-op. That single rule is what keeps an exponential flood of
//! duplicate receipts down to one delivery and one relay per node.
//!
//! Routing an unseen packet:
//!
//! 1. deliver locally when addressed to this node or to `*`
//! 2. relay a copy with `ttl - 1` to all neighbors when `ttl > 0`
//!
//! The two are independent: a broadcast is delivered *and* relayed. Under
//! [`RelayPolicy::SuppressOnDelivery`] an addressed packet that reached its
//! recipient stops there; the default [`RelayPolicy::AlwaysFlood`] relays it
//! anyway.
//!
//! The seen-set is an LRU bounded by `seen_capacity`, so memory stays flat
//! for long-running nodes. Relay failures are logged and swallowed.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::RelayPolicy;
use crate::packet::Packet;
use crate::transport::{SendReport, Transport};

/// Bounded record of packet ids already processed.
pub struct SeenSet {
    ids: LruCache<String, ()>,
}

impl SeenSet {
    /// Create a set holding at most `capacity` ids (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: LruCache::new(capacity),
        }
    }

    /// Insert an id. Returns `true` if it was not present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.get(id).is_some() {
            return false;
        }
        self.ids.put(id.to_string(), ());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }

    /// Ids from oldest to most recent.
    pub fn snapshot(&self) -> Vec<String> {
        self.ids.iter().rev().map(|(id, _)| id.clone()).collect()
    }
}

/// What the router decided for one incoming packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Id already seen; nothing happens
    Duplicate,
    /// First encounter
    Accepted {
        /// Hand to the local store
        deliver: bool,
        /// Copy with `ttl - 1` to flood onward
        relay: Option<Packet>,
    },
}

impl Route {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Route::Duplicate)
    }

    pub fn delivers(&self) -> bool {
        matches!(self, Route::Accepted { deliver: true, .. })
    }

    pub fn relay(&self) -> Option<&Packet> {
        match self {
            Route::Accepted { relay, .. } => relay.as_ref(),
            Route::Duplicate => None,
        }
    }
}

/// Result of [`MeshRouter::handle_incoming`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouteOutcome {
    pub route: Route,
    /// Fan-out result when a relay was attempted
    pub relay_report: Option<SendReport>,
}

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub delivered: AtomicU64,
    pub relayed: AtomicU64,
    pub duplicates: AtomicU64,
    pub dropped: AtomicU64,
}

/// Plain copy of [`RouterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub delivered: u64,
    pub relayed: u64,
    pub duplicates: u64,
    pub dropped: u64,
}

/// Flood-routing state machine for one node.
pub struct MeshRouter {
    local_id: String,
    policy: RelayPolicy,
    seen: Mutex<SeenSet>,
    transport: Arc<dyn Transport>,
    stats: RouterStats,
}

impl MeshRouter {
    /// Create a router.
    ///
    /// # Arguments
    ///
    /// * `local_id` - This node's identity id
    /// * `transport` - Neighbor fan-out used for relays
    /// * `seen_capacity` - Seen-set bound
    /// * `policy` - Relay behavior for addressed packets delivered here
    pub fn new(
        local_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        seen_capacity: usize,
        policy: RelayPolicy,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            policy,
            seen: Mutex::new(SeenSet::new(seen_capacity)),
            transport,
            stats: RouterStats::default(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    /// Mark a packet seen and decide delivery and relay. No I/O.
    ///
    /// The check-and-insert happens under one lock, so two neighbors racing
    /// the same id get exactly one `Accepted`.
    pub fn accept(&self, packet: &Packet) -> Route {
        if !self.seen.lock().insert(packet.id()) {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(packet_id = %packet.id(), "Duplicate packet ignored");
            return Route::Duplicate;
        }

        let deliver = packet.recipient().includes(&self.local_id);
        let suppress = deliver
            && !packet.recipient().is_broadcast()
            && self.policy == RelayPolicy::SuppressOnDelivery;
        let relay = if suppress { None } else { packet.relayed() };

        if deliver {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        if !deliver && relay.is_none() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            packet_id = %packet.id(),
            from = %packet.sender(),
            to = %packet.recipient(),
            ttl = packet.ttl().get(),
            deliver,
            relay = relay.is_some(),
            "Packet accepted"
        );

        Route::Accepted { deliver, relay }
    }

    /// Send a relay copy to all neighbors. Never fails.
    pub async fn relay(&self, packet: &Packet) -> SendReport {
        self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        self.send(packet, "relay").await
    }

    /// Route an incoming packet end to end: dedupe, decide, relay.
    ///
    /// Local delivery is reported in the returned [`Route`]; the caller hands
    /// the packet to its store.
    pub async fn handle_incoming(&self, packet: &Packet) -> RouteOutcome {
        let route = self.accept(packet);
        let relay_report = match route.relay() {
            Some(next) => Some(self.relay(next).await),
            None => None,
        };
        RouteOutcome {
            route,
            relay_report,
        }
    }

    /// Send a locally created packet.
    ///
    /// The id is marked seen first so echoes from neighbors are ignored.
    pub async fn originate(&self, packet: &Packet) -> SendReport {
        self.seen.lock().insert(packet.id());
        self.send(packet, "originate").await
    }

    /// Re-send a packet already marked seen (pending outbox flush).
    pub async fn resend(&self, packet: &Packet) -> SendReport {
        self.send(packet, "resend").await
    }

    async fn send(&self, packet: &Packet, what: &str) -> SendReport {
        let frame = match packet.to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(packet_id = %packet.id(), error = %e, "Failed to encode packet");
                return SendReport::default();
            }
        };
        match self.transport.send_packet(frame).await {
            Ok(report) => {
                tracing::debug!(
                    packet_id = %packet.id(),
                    ttl = packet.ttl().get(),
                    attempted = report.attempted,
                    delivered = report.delivered,
                    "{} sent",
                    what
                );
                report
            }
            Err(e) => {
                tracing::debug!(packet_id = %packet.id(), error = %e, "{} failed", what);
                SendReport::default()
            }
        }
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.lock().contains(id)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Seen ids, oldest first, for persistence.
    pub fn snapshot_seen(&self) -> Vec<String> {
        self.seen.lock().snapshot()
    }

    /// Re-insert persisted ids (oldest first).
    pub fn restore_seen<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = self.seen.lock();
        for id in ids {
            seen.insert(id.as_ref());
        }
    }

    pub fn stats(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
