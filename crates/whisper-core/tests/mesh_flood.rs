//! Multi-hop flood routing over in-process links
//!
//! ## What These Tests Verify
//!
//! - Addressed text crosses a chain and is stored only by its recipient
//! - The hop budget bounds how far a flood travels
//! - A broken link drops traffic without failing the sender
//! - Packets queued while isolated go out when a link comes up
//! - Encrypted text is relayed opaquely and readable only at the ends

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use whisper_core::{
    MeshResult, MeshRouter, MeshSimulation, NodeConfig, Packet, PacketType, RelayPolicy,
    SendReport, Topology, Transport,
};

#[derive(Default)]
struct RecordingTransport {
    frames: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_packet(&self, frame: Bytes) -> MeshResult<SendReport> {
        self.frames.lock().push(frame);
        Ok(SendReport {
            attempted: 1,
            delivered: 1,
            failed: vec![],
        })
    }
}

/// A sends "hello" to B with the default hop budget. B keeps it and, under
/// the default flood policy, still passes it on with one hop less.
#[tokio::test]
async fn test_addressed_packet_is_delivered_and_relayed() {
    let transport = Arc::new(RecordingTransport::default());
    let router = MeshRouter::new("bbb222", transport.clone(), 64, RelayPolicy::default());

    let packet = Packet::create(
        "aaa111",
        "bbb222",
        PacketType::Text,
        json!({"text": "hello"}),
        i64::from(whisper_core::DEFAULT_TTL),
    )
    .unwrap();

    let outcome = router.handle_incoming(&packet).await;
    assert!(outcome.route.delivers());

    let frames = transport.frames.lock().clone();
    assert_eq!(frames.len(), 1);
    let relayed = Packet::from_wire(&frames[0]).unwrap();
    assert_eq!(relayed.id(), packet.id());
    assert_eq!(relayed.ttl().get(), 3);
    assert_eq!(relayed.payload(), packet.payload());
}

#[tokio::test]
async fn test_chain_delivers_to_far_end_only() {
    let sim = MeshSimulation::build(4, Topology::Chain, NodeConfig::default())
        .await
        .unwrap();

    let report = sim.flood(0, Some(3), "over the hill").await.unwrap();
    assert_eq!(report.reached, vec![3]);
    assert!(report.missed.is_empty());

    let far = sim.node(3).unwrap();
    let messages = far.store().get_messages(sim.node(0).unwrap().id());
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), Some("over the hill"));
    assert!(!messages[0].encrypted);

    for middle in [1, 2] {
        assert!(sim.node(middle).unwrap().store().get_conversations().is_empty());
    }
    sim.shutdown().await;
}

#[tokio::test]
async fn test_ttl_bounds_the_flood() {
    let config = NodeConfig::default().with_default_ttl(2);
    let sim = MeshSimulation::build(6, Topology::Chain, config).await.unwrap();

    let report = sim.flood(0, None, "short range").await.unwrap();
    assert_eq!(report.reached, vec![1, 2, 3]);
    assert_eq!(report.missed, vec![4, 5]);
    assert_eq!(report.relays, 2);
    sim.shutdown().await;
}

#[tokio::test]
async fn test_zero_ttl_reaches_direct_neighbors_only() {
    let config = NodeConfig::default().with_default_ttl(0);
    let sim = MeshSimulation::build(3, Topology::Chain, config).await.unwrap();

    let report = sim.flood(0, None, "whisper").await.unwrap();
    assert_eq!(report.reached, vec![1]);
    assert_eq!(report.relays, 0);
    sim.shutdown().await;
}

#[tokio::test]
async fn test_full_mesh_delivers_once_per_node() {
    let sim = MeshSimulation::build(5, Topology::Full, NodeConfig::default())
        .await
        .unwrap();

    let report = sim.flood(2, None, "everyone").await.unwrap();
    assert_eq!(report.reached, vec![0, 1, 3, 4]);
    assert!(report.duplicates > 0);

    for (i, node) in sim.nodes().iter().enumerate() {
        if i == 2 {
            continue;
        }
        assert_eq!(node.store().get_messages("*").len(), 1, "node {}", i);
        assert_eq!(node.router().stats().delivered, 1, "node {}", i);
    }
    sim.shutdown().await;
}

#[tokio::test]
async fn test_suppress_policy_still_floods_broadcasts() {
    let config = NodeConfig::default().with_relay_policy(RelayPolicy::SuppressOnDelivery);
    let sim = MeshSimulation::build(3, Topology::Chain, config).await.unwrap();

    let addressed = sim.flood(0, Some(1), "stop here").await.unwrap();
    assert_eq!(addressed.reached, vec![1]);
    assert_eq!(addressed.relays, 0);

    let broadcast = sim.flood(0, None, "keep going").await.unwrap();
    assert_eq!(broadcast.reached, vec![1, 2]);
    sim.shutdown().await;
}

#[tokio::test]
async fn test_broken_link_drops_silently() {
    let sim = MeshSimulation::build(3, Topology::Chain, NodeConfig::default())
        .await
        .unwrap();
    sim.set_link_down(1, 2, true);

    let report = sim.flood(0, None, "partial").await.unwrap();
    assert_eq!(report.reached, vec![1]);
    assert_eq!(report.missed, vec![2]);
    assert!(sim.node(0).unwrap().store().pending().is_empty());
    sim.shutdown().await;
}

#[tokio::test]
async fn test_isolated_send_goes_out_on_link_up() {
    let mut sim = MeshSimulation::build(2, Topology::None, NodeConfig::default())
        .await
        .unwrap();

    let report = sim.flood(0, None, "anyone?").await.unwrap();
    assert_eq!(report.missed, vec![1]);
    assert_eq!(sim.node(0).unwrap().store().pending().len(), 1);

    sim.connect(0, 1).await.unwrap();
    sim.settle().await;

    assert!(sim.node(0).unwrap().store().pending().is_empty());
    let received = sim.node(1).unwrap().store().get_messages("*");
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, report.packet_id);
    sim.shutdown().await;
}

#[tokio::test]
async fn test_encrypted_text_is_opaque_to_relays() {
    let sim = MeshSimulation::build(3, Topology::Full, NodeConfig::default())
        .await
        .unwrap();

    let report = sim.flood(0, Some(2), "just for you").await.unwrap();
    assert_eq!(report.reached, vec![2]);

    let recipient = sim.node(2).unwrap();
    let stored = recipient.store().get_messages(sim.node(0).unwrap().id());
    assert_eq!(stored.len(), 1);
    assert!(stored[0].encrypted);
    assert!(stored[0].text().is_none());
    assert_eq!(
        recipient.message_text(&stored[0]).unwrap().as_deref(),
        Some("just for you")
    );

    let relay = sim.node(1).unwrap();
    assert!(relay.router().has_seen(&report.packet_id));
    assert!(relay.store().get_conversations().is_empty());
    sim.shutdown().await;
}
