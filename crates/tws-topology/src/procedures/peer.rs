/// Procedures that deal with the other earbud: role discovery and the
/// peer profile connection.
use std::time::Duration;

use tracing::{info, warn};

use crate::goals::GoalParams;
use crate::services::{Indication, ServiceRequest};
use crate::types::ProcedureResult;

use super::{finish_once, Completion, Procedure, ProcedureInput, ProcedureOutput, TimerKind};

// ── FindRole ──────────────────────────────────────────────────────────

/// Ask the role finder which role this node should take.
///
/// The role itself is applied by the topology state when the `RoleFound`
/// indication arrives; this procedure only bounds the wait.
#[derive(Debug)]
pub struct FindRole {
    timeout: Duration,
    completion: Option<Completion>,
}

impl FindRole {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            completion: None,
        }
    }
}

impl Procedure for FindRole {
    fn start(&mut self, completion: Completion, _params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        out.request(ServiceRequest::FindRole);
        out.start_timer(TimerKind::Confirm, self.timeout);
        out.ack_start(true);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        out.request(ServiceRequest::CancelFindRole);
        out.cancel_timer(TimerKind::Confirm);
        finish_once(&mut self.completion, ProcedureResult::Success, out);
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        match input {
            ProcedureInput::Indication(Indication::RoleFound { role }) => {
                info!(%role, "role found");
                out.cancel_timer(TimerKind::Confirm);
                finish_once(&mut self.completion, ProcedureResult::Success, out);
            }
            ProcedureInput::Timer(TimerKind::Confirm) => {
                warn!("role discovery timed out");
                out.request(ServiceRequest::CancelFindRole);
                finish_once(&mut self.completion, ProcedureResult::Timeout, out);
            }
            _ => {}
        }
    }
}

// ── ConnectPeerProfiles ───────────────────────────────────────────────

/// Connect the peer signalling/handover/mirror profiles (primary only).
///
/// Losing the peer link while waiting fails at once; there is nobody left
/// to connect to.
#[derive(Debug)]
pub struct ConnectPeerProfiles {
    confirm_timeout: Duration,
    completion: Option<Completion>,
}

impl ConnectPeerProfiles {
    pub fn new(confirm_timeout: Duration) -> Self {
        Self {
            confirm_timeout,
            completion: None,
        }
    }
}

impl Procedure for ConnectPeerProfiles {
    fn start(&mut self, completion: Completion, _params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        out.request(ServiceRequest::ConnectPeerProfiles);
        out.start_timer(TimerKind::Confirm, self.confirm_timeout);
        out.ack_start(true);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        out.cancel_timer(TimerKind::Confirm);
        finish_once(&mut self.completion, ProcedureResult::Success, out);
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        let result = match input {
            ProcedureInput::Indication(Indication::PeerProfilesConnected { ok: true }) => {
                ProcedureResult::Success
            }
            ProcedureInput::Indication(Indication::PeerProfilesConnected { ok: false }) => {
                ProcedureResult::Failed
            }
            ProcedureInput::Indication(Indication::PeerLinkDown) => {
                warn!("peer link lost while connecting peer profiles");
                ProcedureResult::Failed
            }
            ProcedureInput::Timer(TimerKind::Confirm) => ProcedureResult::Timeout,
            _ => return,
        };
        out.cancel_timer(TimerKind::Confirm);
        finish_once(&mut self.completion, result, out);
    }
}
