use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TopologyError;

/// Reliable, ordered byte channel to the other earbud.
///
/// In a product: the peer signalling profile over the inter-earbud link.
/// In tests and the simulator: [`MemoryPeerChannel`].
#[async_trait::async_trait]
pub trait PeerChannel: Send + Sync {
    /// Hand `data` to the link. `Ok` means delivered to the peer.
    async fn send(&self, data: &[u8]) -> Result<(), TopologyError>;

    /// Next inbound frame. `None` once the channel is closed for good.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}

// ── In-memory channel ─────────────────────────────────────────────────

/// Fault switch shared by both ends of a [`MemoryPeerChannel`] pair.
#[derive(Debug, Clone)]
pub struct LinkControl {
    up: Arc<AtomicBool>,
}

impl LinkControl {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Take the link down: sends fail and frames in flight are lost.
    pub fn drop_link(&self) {
        self.up.store(false, Ordering::SeqCst);
    }

    pub fn restore(&self) {
        self.up.store(true, Ordering::SeqCst);
    }
}

/// One end of an in-process peer link.
pub struct MemoryPeerChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: LinkControl,
}

impl MemoryPeerChannel {
    /// Two connected endpoints and the switch that controls their link.
    pub fn pair() -> (Self, Self, LinkControl) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let link = LinkControl {
            up: Arc::new(AtomicBool::new(true)),
        };
        let a = Self {
            tx: a_tx,
            rx: a_rx,
            link: link.clone(),
        };
        let b = Self {
            tx: b_tx,
            rx: b_rx,
            link: link.clone(),
        };
        (a, b, link)
    }
}

#[async_trait::async_trait]
impl PeerChannel for MemoryPeerChannel {
    async fn send(&self, data: &[u8]) -> Result<(), TopologyError> {
        if !self.link.is_up() {
            return Err(TopologyError::Peer("link down".into()));
        }
        self.tx
            .send(data.to_vec())
            .map_err(|_| TopologyError::Peer("peer endpoint closed".into()))
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            let data = self.rx.recv().await?;
            if self.link.is_up() {
                return Some(data);
            }
            debug!(len = data.len(), "frame lost on a dropped link");
        }
    }
}
