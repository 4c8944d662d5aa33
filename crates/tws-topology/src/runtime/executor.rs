//! Effect executor: the only place that touches I/O.
//!
//! - SendPeer -> peer.send(), delivery reported back as feedback
//! - Service -> service_tx
//! - StartTimer -> detached sleep that reports its token
//! - Emit -> event_tx

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::services::ServiceRequest;

use super::effect::{DeliveryTag, TopologyEffect};
use super::peer::PeerChannel;
use super::timers::TimerToken;
use super::TopologyEvent;

/// Results of executed effects that the state must hear about.
#[derive(Debug)]
pub(super) enum Feedback {
    Delivery { tag: DeliveryTag, ok: bool },
    Timer(TimerToken),
}

/// Execute a list of effects using the given peer channel and channels.
pub(super) async fn execute_effects<P: PeerChannel>(
    effects: Vec<TopologyEffect>,
    peer: &P,
    service_tx: &mpsc::Sender<ServiceRequest>,
    event_tx: &mpsc::Sender<TopologyEvent>,
    feedback_tx: &mpsc::UnboundedSender<Feedback>,
) {
    for effect in effects {
        match effect {
            TopologyEffect::SendPeer { message, tag } => {
                let ok = match message.to_bytes() {
                    Ok(bytes) => match peer.send(&bytes).await {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(error = %e, session = tag.session, "peer send failed");
                            false
                        }
                    },
                    Err(e) => {
                        let _ = event_tx.try_send(TopologyEvent::Error {
                            description: format!("serialize peer message failed: {e}"),
                        });
                        false
                    }
                };
                if !ok || tag.commit {
                    let _ = feedback_tx.send(Feedback::Delivery { tag, ok });
                }
            }
            TopologyEffect::Service(request) => {
                if let Err(e) = service_tx.try_send(request) {
                    warn!(error = %e, "service request dropped");
                }
            }
            TopologyEffect::StartTimer { token, after } => {
                let feedback_tx = feedback_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = feedback_tx.send(Feedback::Timer(token));
                });
            }
            TopologyEffect::Emit(event) => {
                // Never block the loop on a slow listener.
                let _ = event_tx.try_send(event);
            }
        }
    }
}
