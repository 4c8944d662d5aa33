/// Five-phase handover coordinator.
///
/// The outgoing side (current primary) vetoes locally, asks the peer to
/// start, marshals every participant for every device, waits for the peer
/// to confirm unmarshal, sends the commit indication and commits once the
/// peer channel reports it delivered. The incoming side mirrors this:
/// veto, unmarshal chunks in order, confirm, commit on the indication.
///
/// Participants are always walked in registration order. A failure at any
/// point before commit aborts the session and rolls back every participant
/// that was touched. Once commit has started the session can only complete.
///
/// After confirming unmarshal the incoming side no longer times out: the
/// outgoing side may already be committing, so only the commit indication
/// or loss of the peer link ends its session. A peer cancel that reaches the
/// outgoing side while the commit indication is in flight turns the delivery
/// report into an abort.
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::HandoverError;
use crate::types::{DeviceId, HandoverReason, Role};

use super::message::{HandoverMessage, StartStatus};
use super::participant::{HandoverParticipant, ParticipantRegistry};
use super::session::HandoverSession;
use super::{Direction, HandoverOutcome, ParticipantStatus, Phase};

/// Side effect requested by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoverAction {
    /// Send to the peer. `commit` asks for a delivery report that is fed
    /// back through [`HandoverCoordinator::delivery`].
    Send { message: HandoverMessage, commit: bool },
    /// (Re)arm the session's single timer.
    StartTimer { session: u8, after: Duration },
    CancelTimer { session: u8 },
    RetainLink(DeviceId),
    ReleaseLink(DeviceId),
    Started {
        session: u8,
        reason: HandoverReason,
        direction: Direction,
    },
    /// The session ended. `devices` are the handsets it covered.
    Finished {
        direction: Direction,
        devices: Vec<DeviceId>,
        outcome: HandoverOutcome,
    },
}

pub struct HandoverCoordinator {
    registry: ParticipantRegistry,
    chunk_size: usize,
    timeout: Duration,
    next_id: u8,
    session: Option<HandoverSession>,
}

impl HandoverCoordinator {
    pub fn new(registry: ParticipantRegistry, chunk_size: usize, timeout: Duration) -> Self {
        Self {
            registry,
            chunk_size: chunk_size.max(1),
            timeout,
            next_id: 1,
            session: None,
        }
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn session(&self) -> Option<&HandoverSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn local_veto(&self) -> Option<usize> {
        self.registry.iter().position(|p| p.veto())
    }

    fn names(&self) -> Vec<String> {
        self.registry.names().into_iter().map(String::from).collect()
    }

    // ── Outgoing ──────────────────────────────────────────────────────

    /// Begin handing the primary role for `devices` to the peer.
    pub fn start(&mut self, reason: HandoverReason, devices: Vec<DeviceId>) -> Vec<HandoverAction> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if let Some(current) = &self.session {
            warn!(session = id, current = current.id(), "handover already running");
            return vec![HandoverAction::Finished {
                direction: Direction::Outgoing,
                devices,
                outcome: HandoverOutcome::Failed {
                    session: id,
                    error: HandoverError::Busy,
                },
            }];
        }

        let mut session =
            HandoverSession::new(id, Direction::Outgoing, reason, devices.clone(), self.registry.len());
        session.advance(Phase::Veto);
        info!(session = id, ?reason, devices = devices.len(), "handover starting");
        let mut actions = vec![HandoverAction::Started {
            session: id,
            reason,
            direction: Direction::Outgoing,
        }];

        if let Some(idx) = self.local_veto() {
            let participant = self.registry.get(idx).name();
            warn!(session = id, participant, "handover vetoed");
            session.set_status(idx, ParticipantStatus::Vetoed);
            session.advance(Phase::Abort);
            actions.push(HandoverAction::Finished {
                direction: Direction::Outgoing,
                devices,
                outcome: HandoverOutcome::Failed {
                    session: id,
                    error: HandoverError::Vetoed { participant },
                },
            });
            return actions;
        }

        actions.push(HandoverAction::Send {
            message: HandoverMessage::StartReq {
                session: id,
                participants: self.names(),
                devices,
                reason,
            },
            commit: false,
        });
        actions.push(HandoverAction::StartTimer {
            session: id,
            after: self.timeout,
        });
        self.session = Some(session);
        actions
    }

    /// Abort an outgoing session unless commit has started.
    pub fn cancel(&mut self) -> Vec<HandoverAction> {
        let Some(session) = &self.session else {
            return Vec::new();
        };
        if session.direction() != Direction::Outgoing {
            return Vec::new();
        }
        if session.commit_sent {
            info!(session = session.id(), "commit in progress, cancel ignored");
            return Vec::new();
        }
        self.abort(HandoverError::Cancelled, true)
    }

    fn on_start_cfm(&mut self, status: StartStatus) -> Vec<HandoverAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.phase() != Phase::Veto {
            warn!(session = session.id(), phase = ?session.phase(), "duplicate start confirmation dropped");
            return Vec::new();
        }
        match status {
            StartStatus::Accepted => {
                session.peer_engaged = true;
                session.advance(Phase::Marshal);
                self.marshal()
            }
            StartStatus::Vetoed => self.abort(HandoverError::PeerVetoed, false),
            StartStatus::Mismatch => self.abort(HandoverError::ParticipantMismatch, false),
            StartStatus::Busy => self.abort(HandoverError::PeerBusy, false),
        }
    }

    fn marshal(&mut self) -> Vec<HandoverAction> {
        let mut actions = Vec::new();
        match self.marshal_participants(&mut actions) {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.advance(Phase::Unmarshal);
                    actions.push(HandoverAction::StartTimer {
                        session: session.id(),
                        after: self.timeout,
                    });
                }
            }
            Err(error) => actions.extend(self.abort(error, true)),
        }
        actions
    }

    /// Marshal every participant for every device into chunk-sized messages.
    fn marshal_participants(&mut self, actions: &mut Vec<HandoverAction>) -> Result<(), HandoverError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let id = session.id();
        let devices = session.devices().to_vec();
        let mut buf = vec![0u8; self.chunk_size];

        for idx in 0..self.registry.len() {
            let participant = self.registry.get_mut(idx);
            let name = participant.name();
            session.touch(idx);
            for (d, &device) in devices.iter().enumerate() {
                loop {
                    let progress = participant
                        .marshal(device, &mut buf)
                        .map_err(|e| HandoverError::Marshal {
                            participant: name,
                            reason: e.0,
                        })?;
                    if progress.bytes > buf.len() {
                        return Err(HandoverError::Marshal {
                            participant: name,
                            reason: format!("wrote {} bytes into a {} byte buffer", progress.bytes, buf.len()),
                        });
                    }
                    if progress.bytes == 0 && !progress.done {
                        return Err(HandoverError::Marshal {
                            participant: name,
                            reason: "no progress".into(),
                        });
                    }
                    debug!(session = id, participant = name, %device, bytes = progress.bytes, last = progress.done, "marshal chunk");
                    actions.push(HandoverAction::Send {
                        message: HandoverMessage::MarshalData {
                            session: id,
                            participant: idx as u16,
                            device,
                            bytes: Bytes::copy_from_slice(&buf[..progress.bytes]),
                            last: progress.done,
                        },
                        commit: false,
                    });
                    if progress.done {
                        session.mark_transferred(idx, d);
                        break;
                    }
                }
            }
            session.set_status(idx, ParticipantStatus::Marshalled);
        }
        Ok(())
    }

    fn on_unmarshal_cfm(&mut self) -> Vec<HandoverAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.phase() != Phase::Unmarshal || session.commit_sent {
            warn!(session = session.id(), phase = ?session.phase(), "unexpected unmarshal confirmation dropped");
            return Vec::new();
        }
        let id = session.id();
        session.set_all(ParticipantStatus::Unmarshalled);

        let mut actions = Vec::new();
        for &device in session.devices() {
            actions.push(HandoverAction::RetainLink(device));
        }
        session.retained = session.devices().to_vec();
        session.commit_sent = true;
        info!(session = id, "peer unmarshalled, sending commit");
        actions.push(HandoverAction::Send {
            message: HandoverMessage::CommitInd { session: id },
            commit: true,
        });
        actions.push(HandoverAction::StartTimer {
            session: id,
            after: self.timeout,
        });
        actions
    }

    /// Delivery report for a message sent to the peer.
    pub fn delivery(&mut self, session: u8, commit: bool, ok: bool) -> Vec<HandoverAction> {
        let Some(current) = &self.session else {
            return Vec::new();
        };
        if current.id() != session {
            debug!(session, current = current.id(), "delivery report for old session");
            return Vec::new();
        }
        if !ok {
            // A peer waiting for the commit indication needs to hear about it.
            return self.abort(HandoverError::Transport("peer channel send failed".into()), commit);
        }
        if commit && current.direction() == Direction::Outgoing && current.commit_sent {
            if current.peer_cancelled {
                warn!(session, "commit delivered after the peer cancelled, aborting");
                return self.abort(HandoverError::PeerAborted, false);
            }
            return self.commit(false);
        }
        Vec::new()
    }

    // ── Incoming ──────────────────────────────────────────────────────

    fn on_start_req(
        &mut self,
        id: u8,
        participants: Vec<String>,
        devices: Vec<DeviceId>,
        reason: HandoverReason,
        role: Role,
    ) -> Vec<HandoverAction> {
        let reply = |status| HandoverAction::Send {
            message: HandoverMessage::StartCfm { session: id, status },
            commit: false,
        };
        if let Some(current) = &self.session {
            warn!(session = id, current = current.id(), "start request while a session is running");
            return vec![reply(StartStatus::Busy)];
        }
        if !role.is_secondary() {
            warn!(session = id, %role, "start request while not secondary");
            return vec![reply(StartStatus::Busy)];
        }
        if !self.registry.matches(&participants) {
            warn!(session = id, theirs = ?participants, ours = ?self.registry.names(), "participant mismatch");
            return vec![reply(StartStatus::Mismatch)];
        }
        if let Some(idx) = self.local_veto() {
            warn!(session = id, participant = self.registry.get(idx).name(), "incoming handover vetoed");
            return vec![reply(StartStatus::Vetoed)];
        }

        let mut session =
            HandoverSession::new(id, Direction::Incoming, reason, devices, self.registry.len());
        session.advance(Phase::Veto);
        session.advance(Phase::Unmarshal);
        session.peer_engaged = true;
        info!(session = id, ?reason, "accepting incoming handover");
        let mut actions = vec![
            HandoverAction::Started {
                session: id,
                reason,
                direction: Direction::Incoming,
            },
            reply(StartStatus::Accepted),
            HandoverAction::StartTimer {
                session: id,
                after: self.timeout,
            },
        ];
        let nothing_to_receive = session.next_pending().is_none();
        self.session = Some(session);
        if nothing_to_receive {
            actions.extend(self.unmarshal_complete());
        }
        actions
    }

    fn on_marshal_data(
        &mut self,
        participant: u16,
        device: DeviceId,
        bytes: &[u8],
        last: bool,
    ) -> Vec<HandoverAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let Some((expected, d)) = session.next_pending() else {
            return self.abort(
                HandoverError::Protocol("marshal data after unmarshal completed".into()),
                true,
            );
        };
        if participant as usize != expected || session.device_index(device) != Some(d) {
            return self.abort(
                HandoverError::Protocol(format!(
                    "marshal data for participant {participant} {device} out of order"
                )),
                true,
            );
        }

        session.touch(expected);
        let target = self.registry.get_mut(expected);
        match feed(target, device, bytes, last) {
            Err(error) => self.abort(error, true),
            Ok(false) => Vec::new(),
            Ok(true) => {
                session.mark_transferred(expected, d);
                if session.participant_done(expected) {
                    session.set_status(expected, ParticipantStatus::Unmarshalled);
                }
                if session.next_pending().is_none() {
                    self.unmarshal_complete()
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn unmarshal_complete(&mut self) -> Vec<HandoverAction> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        let id = session.id();
        session.set_all(ParticipantStatus::Unmarshalled);
        session.unmarshal_confirmed = true;
        info!(session = id, "all participants unmarshalled, waiting for commit");
        vec![
            HandoverAction::Send {
                message: HandoverMessage::UnmarshalCfm { session: id },
                commit: false,
            },
            HandoverAction::CancelTimer { session: id },
        ]
    }

    fn on_commit_ind(&mut self) -> Vec<HandoverAction> {
        let ready = self
            .session
            .as_ref()
            .is_some_and(|s| s.phase() == Phase::Unmarshal && s.next_pending().is_none());
        if !ready {
            return self.abort(
                HandoverError::Protocol("commit before unmarshal completed".into()),
                true,
            );
        }
        self.commit(true)
    }

    // ── Shared ────────────────────────────────────────────────────────

    /// Inbound handover message. `role` is the node's current role.
    pub fn handle_message(&mut self, message: HandoverMessage, role: Role) -> Vec<HandoverAction> {
        if let HandoverMessage::StartReq {
            session,
            participants,
            devices,
            reason,
        } = message
        {
            return self.on_start_req(session, participants, devices, reason, role);
        }

        let Some(current) = &self.session else {
            warn!(session = message.session(), kind = message.kind(), "handover message for no session dropped");
            return Vec::new();
        };
        if current.id() != message.session() {
            warn!(
                session = message.session(),
                current = current.id(),
                kind = message.kind(),
                "handover message for another session dropped"
            );
            return Vec::new();
        }

        match (current.direction(), message) {
            (Direction::Outgoing, HandoverMessage::StartCfm { status, .. }) => self.on_start_cfm(status),
            (Direction::Outgoing, HandoverMessage::UnmarshalCfm { .. }) => self.on_unmarshal_cfm(),
            (Direction::Outgoing, HandoverMessage::CancelInd { .. }) => {
                if current.commit_sent {
                    warn!(session = current.id(), "peer cancelled while commit is in flight");
                    if let Some(session) = self.session.as_mut() {
                        session.peer_cancelled = true;
                    }
                    return Vec::new();
                }
                self.abort(HandoverError::PeerAborted, false)
            }
            (
                Direction::Incoming,
                HandoverMessage::MarshalData {
                    participant,
                    device,
                    bytes,
                    last,
                    ..
                },
            ) => self.on_marshal_data(participant, device, &bytes, last),
            (Direction::Incoming, HandoverMessage::CommitInd { .. }) => self.on_commit_ind(),
            (Direction::Incoming, HandoverMessage::CancelInd { .. }) => {
                self.abort(HandoverError::Cancelled, false)
            }
            (direction, message) => {
                let kind = message.kind();
                warn!(?direction, kind, "unexpected handover message");
                self.abort(HandoverError::Protocol(format!("unexpected {kind}")), true)
            }
        }
    }

    /// The session timer fired.
    pub fn timeout(&mut self, session: u8) -> Vec<HandoverAction> {
        match &self.session {
            Some(current) if current.id() == session && current.unmarshal_confirmed => {
                debug!(session, "timer ignored while waiting for the commit indication");
                Vec::new()
            }
            Some(current) if current.id() == session => {
                let phase = current.phase();
                warn!(session, ?phase, "handover timed out");
                self.abort(HandoverError::Timeout { phase }, true)
            }
            _ => Vec::new(),
        }
    }

    /// The link to the peer is gone.
    pub fn peer_link_lost(&mut self) -> Vec<HandoverAction> {
        if self.session.is_none() {
            return Vec::new();
        }
        self.abort(HandoverError::Transport("peer link lost".into()), false)
    }

    /// Commit then complete every participant. The session ends here.
    fn commit(&mut self, becoming_primary: bool) -> Vec<HandoverAction> {
        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };
        let id = session.id();
        session.advance(Phase::Commit);
        for idx in 0..self.registry.len() {
            if session.status(idx) != ParticipantStatus::Unmarshalled {
                panic!(
                    "handover session {id}: participant {} committed without completed unmarshal",
                    self.registry.get(idx).name()
                );
            }
            let participant = self.registry.get_mut(idx);
            for &device in session.devices() {
                participant.commit(device, becoming_primary);
            }
            session.set_status(idx, ParticipantStatus::Committed);
        }
        session.advance(Phase::Complete);
        for idx in 0..self.registry.len() {
            self.registry.get_mut(idx).complete(becoming_primary);
        }

        let role = if becoming_primary {
            Role::Primary
        } else {
            Role::Secondary
        };
        info!(session = id, %role, "handover committed");
        let mut actions: Vec<HandoverAction> = session
            .retained
            .iter()
            .map(|&device| HandoverAction::ReleaseLink(device))
            .collect();
        actions.push(HandoverAction::CancelTimer { session: id });
        actions.push(HandoverAction::Finished {
            direction: session.direction(),
            devices: session.devices().to_vec(),
            outcome: HandoverOutcome::Committed { session: id, role },
        });
        actions
    }

    /// Roll back every touched participant and end the session.
    fn abort(&mut self, error: HandoverError, notify_peer: bool) -> Vec<HandoverAction> {
        let Some(mut session) = self.session.take() else {
            return Vec::new();
        };
        let id = session.id();
        for idx in 0..self.registry.len() {
            if session.is_touched(idx) {
                self.registry.get_mut(idx).abort();
                session.set_status(idx, ParticipantStatus::Aborted);
            }
        }
        session.advance(Phase::Abort);
        warn!(session = id, %error, "handover aborted");

        let mut actions: Vec<HandoverAction> = session
            .retained
            .iter()
            .map(|&device| HandoverAction::ReleaseLink(device))
            .collect();
        if notify_peer && session.peer_engaged {
            actions.push(HandoverAction::Send {
                message: HandoverMessage::CancelInd { session: id },
                commit: false,
            });
        }
        actions.push(HandoverAction::CancelTimer { session: id });
        actions.push(HandoverAction::Finished {
            direction: session.direction(),
            devices: session.devices().to_vec(),
            outcome: HandoverOutcome::Failed { session: id, error },
        });
        actions
    }
}

impl std::fmt::Debug for HandoverCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoverCoordinator")
            .field("registry", &self.registry)
            .field("session", &self.session)
            .finish()
    }
}

/// Feed one chunk to a participant. Returns whether its state for the
/// device is now complete.
fn feed(
    participant: &mut dyn HandoverParticipant,
    device: DeviceId,
    bytes: &[u8],
    last: bool,
) -> Result<bool, HandoverError> {
    let name = participant.name();
    let mut offset = 0;
    loop {
        let progress = participant
            .unmarshal(device, &bytes[offset..])
            .map_err(|e| HandoverError::Unmarshal {
                participant: name,
                reason: e.0,
            })?;
        let remaining = bytes.len() - offset;
        if progress.bytes > remaining {
            return Err(HandoverError::Unmarshal {
                participant: name,
                reason: format!("consumed {} of {remaining} bytes", progress.bytes),
            });
        }
        offset += progress.bytes;
        if progress.done {
            if offset < bytes.len() || !last {
                return Err(HandoverError::TrailingBytes { participant: name });
            }
            return Ok(true);
        }
        if offset == bytes.len() {
            break;
        }
        if progress.bytes == 0 {
            return Err(HandoverError::Unmarshal {
                participant: name,
                reason: "stalled with unconsumed bytes".into(),
            });
        }
    }
    if last {
        return Err(HandoverError::Truncated { participant: name });
    }
    Ok(false)
}
