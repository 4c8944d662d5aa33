/// The topology event loop.
///
/// A single async task that owns the [`TopologyState`] and multiplexes over
/// application commands, inbound peer frames, and executor feedback
/// (delivery reports and timer expiries).
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::services::ServiceRequest;

use super::executor::{execute_effects, Feedback};
use super::peer::PeerChannel;
use super::state::TopologyState;
use super::{TopologyCommand, TopologyEvent};

pub(super) async fn topology_loop<P: PeerChannel>(
    mut peer: P,
    mut state: TopologyState,
    mut cmd_rx: mpsc::Receiver<TopologyCommand>,
    service_tx: mpsc::Sender<ServiceRequest>,
    event_tx: mpsc::Sender<TopologyEvent>,
) {
    let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
    let mut peer_open = true;

    loop {
        let effects = tokio::select! {
            // ── 1. Application commands ─────────────────────────────
            cmd = cmd_rx.recv() => match cmd {
                Some(TopologyCommand::Shutdown) | None => {
                    info!("topology runtime shutting down");
                    break;
                }
                Some(cmd) => state.handle_command(cmd),
            },

            // ── 2. Inbound peer frames ──────────────────────────────
            frame = peer.recv(), if peer_open => match frame {
                Some(data) => state.handle_peer_bytes(&data),
                None => {
                    debug!("peer channel closed");
                    peer_open = false;
                    continue;
                }
            },

            // ── 3. Delivery reports and timers ──────────────────────
            Some(feedback) = feedback_rx.recv() => match feedback {
                Feedback::Delivery { tag, ok } => state.handle_delivery(tag, ok),
                Feedback::Timer(token) => state.handle_timer(token),
            },
        };

        execute_effects(effects, &peer, &service_tx, &event_tx, &feedback_tx).await;
    }
}
