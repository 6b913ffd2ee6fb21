//! TCP links
//!
//! A [`TcpLink`] carries the same frames as any other [`Link`], each one
//! prefixed with a 4-byte big-endian length (tokio-util's
//! [`LengthDelimitedCodec`]). The write half sits behind an async mutex so
//! concurrent sends never interleave; the read half runs in its own task
//! and pushes every frame into the node inbox tagged with the link label.
//!
//! When the reader sees EOF or an error the link is marked closed. The
//! returned [`JoinHandle`] completes at that point, which is what the node
//! watches to tear the link down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::{MeshError, MeshResult};
use crate::transport::{InboundFrame, Link};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A link over one TCP connection.
pub struct TcpLink {
    label: String,
    writer: Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>,
    closed: Arc<AtomicBool>,
}

impl TcpLink {
    /// Wrap an established stream and start its reader task.
    ///
    /// # Arguments
    ///
    /// * `stream` - Connected socket (either side)
    /// * `inbox` - Where received frames are delivered
    pub fn spawn(
        stream: TcpStream,
        inbox: mpsc::Sender<InboundFrame>,
    ) -> MeshResult<(Arc<Self>, JoinHandle<()>)> {
        stream.set_nodelay(true)?;
        let label = format!("tcp:{}", stream.peer_addr()?);
        let (read, write) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));

        let link = Arc::new(Self {
            label: label.clone(),
            writer: Mutex::new(FramedWrite::new(write, codec())),
            closed: closed.clone(),
        });
        let reader = tokio::spawn(read_frames(
            label,
            FramedRead::new(read, codec()),
            inbox,
            closed,
        ));
        Ok((link, reader))
    }

    /// Dial `addr` and wrap the connection.
    pub async fn connect(
        addr: SocketAddr,
        inbox: mpsc::Sender<InboundFrame>,
    ) -> MeshResult<(Arc<Self>, JoinHandle<()>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Transport(format!("connect {}: {}", addr, e)))?;
        tracing::debug!(%addr, "TCP connected");
        Self::spawn(stream, inbox)
    }
}

async fn read_frames(
    label: String,
    mut frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    inbox: mpsc::Sender<InboundFrame>,
    closed: Arc<AtomicBool>,
) {
    while let Some(next) = frames.next().await {
        match next {
            Ok(data) => {
                let frame = InboundFrame {
                    link: label.clone(),
                    data: data.freeze(),
                };
                if inbox.send(frame).await.is_err() {
                    // node inbox dropped
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(link = %label, error = %e, "TCP read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    tracing::debug!(link = %label, "TCP reader finished");
}

#[async_trait]
impl Link for TcpLink {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Bytes) -> MeshResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Transport(format!("link {} is closed", self.label)));
        }
        let mut writer = self.writer.lock().await;
        writer.send(frame).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            MeshError::Transport(format!("write to {}: {}", self.label, e))
        })
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
