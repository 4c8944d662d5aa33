/// Per-session bookkeeping for the handover coordinator.
use tracing::debug;

use crate::types::{DeviceId, HandoverReason};

use super::{Direction, ParticipantStatus, Phase};

/// One handover attempt, from veto to complete or abort.
#[derive(Debug)]
pub struct HandoverSession {
    id: u8,
    direction: Direction,
    reason: HandoverReason,
    devices: Vec<DeviceId>,
    phase: Phase,
    statuses: Vec<ParticipantStatus>,
    /// Participant received a marshal or unmarshal call.
    touched: Vec<bool>,
    /// `[participant][device]`: marshal (outgoing) or unmarshal (incoming) done.
    transferred: Vec<Vec<bool>>,
    /// Links retained for the commit step.
    pub(crate) retained: Vec<DeviceId>,
    /// CommitInd handed to the peer channel; the session can no longer be cancelled.
    pub(crate) commit_sent: bool,
    /// StartReq accepted; the peer holds a session too.
    pub(crate) peer_engaged: bool,
    /// Incoming: UnmarshalCfm sent. Only the commit indication or peer link
    /// loss ends the session from here.
    pub(crate) unmarshal_confirmed: bool,
    /// Outgoing: the peer cancelled while the commit indication was in flight.
    pub(crate) peer_cancelled: bool,
}

impl HandoverSession {
    pub fn new(
        id: u8,
        direction: Direction,
        reason: HandoverReason,
        devices: Vec<DeviceId>,
        participants: usize,
    ) -> Self {
        let per_device = vec![false; devices.len()];
        Self {
            id,
            direction,
            reason,
            phase: Phase::Idle,
            statuses: vec![ParticipantStatus::Pending; participants],
            touched: vec![false; participants],
            transferred: vec![per_device; participants],
            devices,
            retained: Vec::new(),
            commit_sent: false,
            peer_engaged: false,
            unmarshal_confirmed: false,
            peer_cancelled: false,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn reason(&self) -> HandoverReason {
        self.reason
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn status(&self, participant: usize) -> ParticipantStatus {
        self.statuses[participant]
    }

    pub fn statuses(&self) -> &[ParticipantStatus] {
        &self.statuses
    }

    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// On a transition the phase order does not allow, in particular any
    /// abort once commit has started.
    pub fn advance(&mut self, next: Phase) {
        use Phase::*;
        let legal = match (self.phase, next) {
            (Idle, Veto) => true,
            (Veto, Marshal | Abort) => true,
            (Veto, Unmarshal) => self.direction == Direction::Incoming,
            (Marshal, Unmarshal | Abort) => true,
            (Unmarshal, Commit | Abort) => true,
            (Commit, Complete) => true,
            _ => false,
        };
        if !legal {
            panic!(
                "handover session {}: illegal phase transition {:?} -> {:?}",
                self.id, self.phase, next
            );
        }
        debug!(session = self.id, from = ?self.phase, to = ?next, "handover phase");
        self.phase = next;
    }

    pub(crate) fn set_status(&mut self, participant: usize, status: ParticipantStatus) {
        self.statuses[participant] = status;
    }

    pub(crate) fn set_all(&mut self, status: ParticipantStatus) {
        self.statuses.fill(status);
    }

    pub(crate) fn touch(&mut self, participant: usize) {
        self.touched[participant] = true;
    }

    pub fn is_touched(&self, participant: usize) -> bool {
        self.touched[participant]
    }

    pub(crate) fn mark_transferred(&mut self, participant: usize, device: usize) {
        self.transferred[participant][device] = true;
    }

    pub(crate) fn is_transferred(&self, participant: usize, device: usize) -> bool {
        self.transferred[participant][device]
    }

    /// Whether every device of `participant` is done.
    pub(crate) fn participant_done(&self, participant: usize) -> bool {
        self.transferred[participant].iter().all(|d| *d)
    }

    /// First `(participant, device)` pair not transferred yet.
    pub(crate) fn next_pending(&self) -> Option<(usize, usize)> {
        self.transferred.iter().enumerate().find_map(|(p, devices)| {
            devices.iter().position(|done| !done).map(|d| (p, d))
        })
    }

    pub(crate) fn device_index(&self, device: DeviceId) -> Option<usize> {
        self.devices.iter().position(|d| *d == device)
    }
}
