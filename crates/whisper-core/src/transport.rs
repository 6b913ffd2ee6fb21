//! Best-effort frame delivery to directly linked neighbors
//!
//! The radio layer is out of scope; what the mesh needs from it is captured
//! by two seams:
//!
//! - [`Link`]: one open connection to one neighbor (channel, TCP, radio …)
//! - [`Transport`]: "send this frame to everyone I'm linked to"
//!
//! [`FanoutTransport`] implements the second on top of a set of the first:
//!
//! ```text
//!                         ┌──────────────┐
//!                    ┌───▶│ Link (tcp)   │──▶ neighbor B
//! ┌───────────────┐  │    └──────────────┘
//! │FanoutTransport│──┼───▶│ Link (chan)  │──▶ neighbor C     each send has its
//! └───────────────┘  │    └──────────────┘                   own timeout and
//!                    └───▶│ Link (…)     │──▶ neighbor D     failure boundary
//!                         └──────────────┘
//! ```
//!
//! A slow or broken neighbor never delays or aborts the others, and per-link
//! failures come back in a [`SendReport`] instead of an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{MeshError, MeshResult};

/// A frame received from a neighbor.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Label of the link the frame arrived on
    pub link: String,
    pub data: Bytes,
}

/// Outcome of a fan-out send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Links a send was attempted on
    pub attempted: usize,
    /// Links that accepted the frame
    pub delivered: usize,
    /// Labels of links that failed or timed out
    pub failed: Vec<String>,
}

impl SendReport {
    /// At least one neighbor accepted the frame.
    pub fn any_delivered(&self) -> bool {
        self.delivered > 0
    }
}

/// One direct connection to a neighbor.
#[async_trait]
pub trait Link: Send + Sync {
    /// Stable label for this link (address, channel name, …).
    fn label(&self) -> &str;

    /// Send one frame.
    async fn send(&self, frame: Bytes) -> MeshResult<()>;

    /// False once the link is known to be gone.
    fn is_open(&self) -> bool {
        true
    }
}

/// Send a frame to every reachable neighbor.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_packet(&self, frame: Bytes) -> MeshResult<SendReport>;
}

/// Fans a frame out over all registered [`Link`]s concurrently.
pub struct FanoutTransport {
    links: RwLock<HashMap<String, Arc<dyn Link>>>,
    send_timeout: Duration,
}

impl FanoutTransport {
    /// Create an empty transport.
    ///
    /// # Arguments
    ///
    /// * `send_timeout` - Upper bound for a single link send
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Register a link. Returns `false` if a link with this label was replaced.
    pub fn add_link(&self, link: Arc<dyn Link>) -> bool {
        let label = link.label().to_string();
        let replaced = self.links.write().insert(label.clone(), link).is_some();
        tracing::debug!(link = %label, replaced, "Link registered");
        !replaced
    }

    /// Drop a link by label.
    pub fn remove_link(&self, label: &str) -> bool {
        let removed = self.links.write().remove(label).is_some();
        if removed {
            tracing::debug!(link = %label, "Link removed");
        }
        removed
    }

    /// Labels of all registered links.
    pub fn link_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.links.read().keys().cloned().collect();
        labels.sort();
        labels
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    fn prune_closed(&self) {
        self.links.write().retain(|label, link| {
            let open = link.is_open();
            if !open {
                tracing::debug!(link = %label, "Pruning closed link");
            }
            open
        });
    }
}

#[async_trait]
impl Transport for FanoutTransport {
    async fn send_packet(&self, frame: Bytes) -> MeshResult<SendReport> {
        self.prune_closed();
        let links: Vec<Arc<dyn Link>> = self.links.read().values().cloned().collect();

        let timeout = self.send_timeout;
        let sends = links.iter().map(|link| {
            let frame = frame.clone();
            async move {
                let result = match tokio::time::timeout(timeout, link.send(frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::Transport(format!(
                        "send timed out after {:?}",
                        timeout
                    ))),
                };
                (link.label().to_string(), result)
            }
        });

        let mut report = SendReport {
            attempted: links.len(),
            ..Default::default()
        };
        for (label, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::debug!(link = %label, error = %e, "Neighbor send failed");
                    report.failed.push(label);
                }
            }
        }
        Ok(report)
    }
}

/// In-process link backed by a tokio channel.
///
/// Frames are delivered into the remote node's inbox tagged with `origin`,
/// the label under which the remote side knows this sender.
pub struct ChannelLink {
    label: String,
    origin: String,
    tx: mpsc::Sender<InboundFrame>,
    down: AtomicBool,
}

impl ChannelLink {
    /// # Arguments
    ///
    /// * `label` - How the local node names this link
    /// * `origin` - How the remote node names the reverse link
    /// * `tx` - The remote node's inbox
    pub fn new(
        label: impl Into<String>,
        origin: impl Into<String>,
        tx: mpsc::Sender<InboundFrame>,
    ) -> Self {
        Self {
            label: label.into(),
            origin: origin.into(),
            tx,
            down: AtomicBool::new(false),
        }
    }

    /// Simulate a broken radio: sends fail while down.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Link for ChannelLink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Bytes) -> MeshResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(MeshError::Transport(format!("link {} is down", self.label)));
        }
        self.tx
            .send(InboundFrame {
                link: self.origin.clone(),
                data: frame,
            })
            .await
            .map_err(|_| MeshError::Transport(format!("link {} closed", self.label)))
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
