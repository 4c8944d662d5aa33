/// Envelope for everything carried over the peer channel.
use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::handover::HandoverMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Handover(HandoverMessage),
}

impl PeerMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TopologyError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TopologyError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

impl From<HandoverMessage> for PeerMessage {
    fn from(message: HandoverMessage) -> Self {
        PeerMessage::Handover(message)
    }
}
