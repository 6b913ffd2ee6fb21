//! In-process mesh simulation
//!
//! Builds N [`MeshNode`]s over [`MemoryKv`] stores and wires them with
//! [`ChannelLink`]s in a fixed topology. Used by the integration tests, the
//! bench and `whisper simulate`.
//!
//! ```text
//!   Full   every pair            Ring   0─1─2─…─n-1─0
//!   Star   0 is the hub          Chain  0─1─2─…─n-1
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::NodeConfig;
use crate::error::{MeshError, MeshResult};
use crate::node::MeshNode;
use crate::packet::BROADCAST;
use crate::storage::MemoryKv;
use crate::transport::ChannelLink;

const SETTLE_POLL: Duration = Duration::from_millis(10);

/// Mesh topology patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Every node linked to every other node
    Full,
    /// Each node linked to the next, wrapping around
    Ring,
    /// All nodes linked to node 0
    Star,
    /// Linear chain
    Chain,
    /// No links; connect manually
    None,
}

impl FromStr for Topology {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Topology::Full),
            "ring" => Ok(Topology::Ring),
            "star" => Ok(Topology::Star),
            "chain" | "linear" => Ok(Topology::Chain),
            "none" | "manual" => Ok(Topology::None),
            other => Err(MeshError::Malformed(format!(
                "unknown topology {:?}; expected full, ring, star, chain or none",
                other
            ))),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Full => "full",
            Topology::Ring => "ring",
            Topology::Star => "star",
            Topology::Chain => "chain",
            Topology::None => "none",
        };
        f.write_str(name)
    }
}

impl Topology {
    /// Undirected edges `(i, j)` with `i < j` for `n` nodes.
    pub fn edges(self, n: usize) -> Vec<(usize, usize)> {
        if n < 2 {
            return vec![];
        }
        match self {
            Topology::Full => (0..n)
                .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
                .collect(),
            Topology::Ring => {
                let mut edges: Vec<_> = (0..n - 1).map(|i| (i, i + 1)).collect();
                if n > 2 {
                    edges.push((0, n - 1));
                }
                edges
            }
            Topology::Star => (1..n).map(|j| (0, j)).collect(),
            Topology::Chain => (0..n - 1).map(|i| (i, i + 1)).collect(),
            Topology::None => vec![],
        }
    }
}

/// Result of [`MeshSimulation::flood`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloodReport {
    pub packet_id: String,
    /// Indexes of nodes (other than the origin) that stored the message
    pub reached: Vec<usize>,
    /// Indexes of nodes the message should have reached but did not
    pub missed: Vec<usize>,
    /// Relay fan-outs across all nodes while the flood ran
    pub relays: u64,
    /// Duplicate receipts dropped across all nodes while the flood ran
    pub duplicates: u64,
}

/// A set of in-process nodes and the links between them.
pub struct MeshSimulation {
    nodes: Vec<Arc<MeshNode>>,
    /// Directed links keyed by (from, to)
    links: HashMap<(usize, usize), Arc<ChannelLink>>,
    topology: Topology,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshSimulation {
    /// Build `n` nodes in `topology` and wait for the hellos to settle.
    ///
    /// Nodes are named `sim-0` … `sim-{n-1}` unless `config` carries a
    /// display name.
    pub async fn build(n: usize, topology: Topology, config: NodeConfig) -> MeshResult<Self> {
        let mut nodes = Vec::with_capacity(n);
        let mut tasks = Vec::with_capacity(n);
        for i in 0..n {
            let mut node_config = config.clone();
            if node_config.display_name.is_none() {
                node_config.display_name = Some(format!("sim-{}", i));
            }
            let node = Arc::new(MeshNode::open(Arc::new(MemoryKv::new()), node_config).await?);
            tasks.push(node.spawn());
            nodes.push(node);
        }

        let mut sim = Self {
            nodes,
            links: HashMap::new(),
            topology,
            tasks,
        };
        for (i, j) in topology.edges(n) {
            sim.connect(i, j).await?;
        }
        sim.settle().await;

        tracing::info!(nodes = n, %topology, links = sim.links.len() / 2, "Simulation built");
        Ok(sim)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn nodes(&self) -> &[Arc<MeshNode>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> MeshResult<&Arc<MeshNode>> {
        self.nodes
            .get(index)
            .ok_or_else(|| MeshError::Malformed(format!("no node {}", index)))
    }

    /// Link nodes `i` and `j` in both directions.
    pub async fn connect(&mut self, i: usize, j: usize) -> MeshResult<()> {
        if i == j {
            return Err(MeshError::Malformed("cannot link a node to itself".into()));
        }
        let a = self.node(i)?.clone();
        let b = self.node(j)?.clone();

        let a_to_b = Arc::new(ChannelLink::new(b.id(), a.id(), b.inbox()));
        let b_to_a = Arc::new(ChannelLink::new(a.id(), b.id(), a.inbox()));
        self.links.insert((i, j), a_to_b.clone());
        self.links.insert((j, i), b_to_a.clone());

        a.link_up(a_to_b).await?;
        b.link_up(b_to_a).await?;
        Ok(())
    }

    /// Remove the link between `i` and `j` on both sides.
    pub fn disconnect(&mut self, i: usize, j: usize) -> MeshResult<()> {
        let a = self.node(i)?.clone();
        let b = self.node(j)?.clone();
        self.links.remove(&(i, j));
        self.links.remove(&(j, i));
        a.link_down(b.id());
        b.link_down(a.id());
        Ok(())
    }

    /// Make sends between `i` and `j` fail without tearing the link down.
    pub fn set_link_down(&self, i: usize, j: usize, down: bool) {
        for key in [(i, j), (j, i)] {
            if let Some(link) = self.links.get(&key) {
                link.set_down(down);
            }
        }
    }

    /// Wait until every inbox is empty and router counters stop moving.
    pub async fn settle(&self) {
        let mut last = self.activity();
        let mut quiet = 0;
        // bounded so a stuck node cannot hang a test
        for _ in 0..500 {
            tokio::time::sleep(SETTLE_POLL).await;
            let now = self.activity();
            let drained = self
                .nodes
                .iter()
                .all(|n| n.inbox().capacity() == n.inbox().max_capacity());
            if drained && now == last {
                quiet += 1;
                if quiet >= 2 {
                    return;
                }
            } else {
                quiet = 0;
            }
            last = now;
        }
        tracing::warn!("Simulation did not settle");
    }

    fn activity(&self) -> u64 {
        self.nodes
            .iter()
            .map(|n| {
                let s = n.router().stats();
                s.delivered + s.relayed + s.duplicates + s.dropped
            })
            .sum()
    }

    fn totals(&self) -> (u64, u64) {
        self.nodes.iter().fold((0, 0), |(r, d), n| {
            let s = n.router().stats();
            (r + s.relayed, d + s.duplicates)
        })
    }

    /// Send text from node `from` (to node `to`, or broadcast when `None`),
    /// let the flood settle and report who got it.
    pub async fn flood(&self, from: usize, to: Option<usize>, text: &str) -> MeshResult<FloodReport> {
        let origin = self.node(from)?.clone();
        let target = match to {
            Some(j) => Some(self.node(j)?.id().to_string()),
            None => None,
        };

        let (relays_before, duplicates_before) = self.totals();
        let outcome = origin
            .send_text(target.as_deref().unwrap_or(BROADCAST), text)
            .await?;
        self.settle().await;
        let (relays_after, duplicates_after) = self.totals();

        let mut reached = Vec::new();
        let mut missed = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if i == from {
                continue;
            }
            let expected = match to {
                Some(j) => i == j,
                None => true,
            };
            let got = node
                .store()
                .snapshot()
                .conversations
                .values()
                .any(|c| c.contains(&outcome.packet_id));
            if got {
                reached.push(i);
            } else if expected {
                missed.push(i);
            }
        }

        Ok(FloodReport {
            packet_id: outcome.packet_id,
            reached,
            missed,
            relays: relays_after - relays_before,
            duplicates: duplicates_after - duplicates_before,
        })
    }

    /// Persist every node's seen-set and stop the inbox loops.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            if let Err(e) = node.shutdown().await {
                tracing::warn!(id = %node.identity().short_id(), error = %e, "Node shutdown failed");
            }
        }
        for task in self.tasks {
            task.abort();
        }
    }
}
