/// Handover messages exchanged between the two nodes.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{DeviceId, HandoverReason};

/// Answer to a [`HandoverMessage::StartReq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartStatus {
    Accepted,
    /// A participant on the incoming side refused.
    Vetoed,
    /// Participant lists differ.
    Mismatch,
    /// A session is already running, or the receiver is not secondary.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoverMessage {
    StartReq {
        session: u8,
        participants: Vec<String>,
        devices: Vec<DeviceId>,
        reason: HandoverReason,
    },
    StartCfm {
        session: u8,
        status: StartStatus,
    },
    /// One marshal chunk. `last` marks the final chunk of `participant`
    /// for `device`.
    MarshalData {
        session: u8,
        participant: u16,
        device: DeviceId,
        bytes: Bytes,
        last: bool,
    },
    UnmarshalCfm {
        session: u8,
    },
    CommitInd {
        session: u8,
    },
    CancelInd {
        session: u8,
    },
}

impl HandoverMessage {
    pub fn session(&self) -> u8 {
        match self {
            HandoverMessage::StartReq { session, .. }
            | HandoverMessage::StartCfm { session, .. }
            | HandoverMessage::MarshalData { session, .. }
            | HandoverMessage::UnmarshalCfm { session }
            | HandoverMessage::CommitInd { session }
            | HandoverMessage::CancelInd { session } => *session,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandoverMessage::StartReq { .. } => "start_req",
            HandoverMessage::StartCfm { .. } => "start_cfm",
            HandoverMessage::MarshalData { .. } => "marshal_data",
            HandoverMessage::UnmarshalCfm { .. } => "unmarshal_cfm",
            HandoverMessage::CommitInd { .. } => "commit_ind",
            HandoverMessage::CancelInd { .. } => "cancel_ind",
        }
    }
}
