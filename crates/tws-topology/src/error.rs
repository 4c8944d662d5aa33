/// Error types for the topology runtime and the handover protocol.
use crate::handover::Phase;

/// Why a handover session did not commit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandoverError {
    #[error("vetoed by local participant {participant}")]
    Vetoed { participant: &'static str },

    #[error("vetoed by peer")]
    PeerVetoed,

    #[error("peer is busy with another session or not in a role to accept")]
    PeerBusy,

    #[error("participant lists differ between the nodes")]
    ParticipantMismatch,

    #[error("a handover session is already running")]
    Busy,

    #[error("marshal failed in {participant}: {reason}")]
    Marshal {
        participant: &'static str,
        reason: String,
    },

    #[error("unmarshal failed in {participant}: {reason}")]
    Unmarshal {
        participant: &'static str,
        reason: String,
    },

    #[error("state stream for {participant} ended before the participant was done")]
    Truncated { participant: &'static str },

    #[error("state stream for {participant} continues after the participant was done")]
    TrailingBytes { participant: &'static str },

    #[error("peer channel failure: {0}")]
    Transport(String),

    #[error("timed out in {phase:?} phase")]
    Timeout { phase: Phase },

    #[error("handover cancelled")]
    Cancelled,

    #[error("peer aborted the session")]
    PeerAborted,

    #[error("peer protocol violation: {0}")]
    Protocol(String),
}

impl HandoverError {
    /// Whether a fresh attempt may succeed without anything else changing.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HandoverError::Vetoed { .. }
                | HandoverError::PeerVetoed
                | HandoverError::PeerBusy
                | HandoverError::Timeout { .. }
        )
    }
}

/// Errors surfaced by the topology runtime.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("topology runtime is not running")]
    RuntimeClosed,

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("peer channel error: {0}")]
    Peer(String),

    #[error("handover error: {0}")]
    Handover(#[from] HandoverError),
}

impl From<rmp_serde::encode::Error> for TopologyError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TopologyError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TopologyError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TopologyError::Decode(e.to_string())
    }
}
