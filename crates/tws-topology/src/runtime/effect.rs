/// Side effects produced by the pure topology state.
///
/// Every `TopologyState::handle_*` returns `Vec<TopologyEffect>`; the event
/// loop hands them to the executor, which is the only code doing I/O.
use std::time::Duration;

use crate::protocol::PeerMessage;
use crate::services::ServiceRequest;

use super::timers::TimerToken;
use super::TopologyEvent;

/// Identifies a peer send whose fate the state wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTag {
    pub session: u8,
    /// Commit indications are always reported back, delivered or not.
    pub commit: bool,
}

#[derive(Debug)]
pub enum TopologyEffect {
    /// Send to the peer. Failures (and every commit send) come back as
    /// delivery feedback carrying `tag`.
    SendPeer { message: PeerMessage, tag: DeliveryTag },

    /// Forward a request to the external services.
    Service(ServiceRequest),

    /// Fire `token` back into the loop after `after`.
    StartTimer { token: TimerToken, after: Duration },

    /// Notify the application.
    Emit(TopologyEvent),
}
