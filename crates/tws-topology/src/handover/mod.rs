/// Live role handover between the two earbuds.
///
/// A session walks every registered [`HandoverParticipant`] through
/// veto, marshal, unmarshal and commit, then completes, or aborts and rolls
/// every touched participant back. The [`HandoverCoordinator`] is pure: it
/// returns [`HandoverAction`]s for the runtime to perform.
pub mod codec;
pub mod coordinator;
pub mod message;
pub mod participant;
pub mod session;

pub use codec::{MarshalCursor, ProfileParticipant, ProfileState, UnmarshalBuffer};
pub use coordinator::{HandoverAction, HandoverCoordinator};
pub use message::{HandoverMessage, StartStatus};
pub use participant::{HandoverParticipant, MarshalError, MarshalProgress, ParticipantRegistry};
pub use session::HandoverSession;

use serde::{Deserialize, Serialize};

use crate::error::HandoverError;
use crate::types::Role;

/// Session phase. Transitions are checked by [`HandoverSession::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Veto,
    Marshal,
    Unmarshal,
    Commit,
    Complete,
    Abort,
}

/// Where one participant got to in the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Pending,
    Vetoed,
    Marshalled,
    Unmarshalled,
    Committed,
    Aborted,
}

/// Which side of the transfer this node is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Current primary handing its role away.
    Outgoing,
    /// Current secondary taking the role over.
    Incoming,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoverOutcome {
    Committed { session: u8, role: Role },
    Failed { session: u8, error: HandoverError },
}

impl HandoverOutcome {
    pub fn session(&self) -> u8 {
        match self {
            HandoverOutcome::Committed { session, .. } | HandoverOutcome::Failed { session, .. } => {
                *session
            }
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, HandoverOutcome::Committed { .. })
    }
}
