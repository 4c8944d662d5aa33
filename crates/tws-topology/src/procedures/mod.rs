/// Procedures: the asynchronous state machines behind goals.
///
/// A procedure never blocks. `start`, `cancel` and `handle` run to
/// completion and describe what should happen next through a
/// [`ProcedureOutput`]; later confirmations and timer expiries come back in
/// through `handle`.
///
/// Every run is handed a single [`Completion`] token. Consuming it is the
/// only way to report a terminal result, so a procedure cannot finish twice.
/// Whether that result is reported to the goal executor as "completed" or
/// "cancelled" depends only on whether a cancel was requested first.
mod connect_handset;
mod disconnect_handset;
mod dynamic_handover;
mod peer;
mod sequence;

pub use connect_handset::ConnectHandset;
pub use disconnect_handset::DisconnectHandset;
pub use dynamic_handover::DynamicHandover;
pub use peer::{ConnectPeerProfiles, FindRole};
pub use sequence::{Expect, Sequence, Step};

use std::fmt;
use std::time::Duration;

use crate::config::TopologyConfig;
use crate::goals::{GoalId, GoalParams, RunId};
use crate::handover::HandoverOutcome;
use crate::services::{Indication, ServiceRequest, Setting};
use crate::types::{HandoverReason, ProcedureResult};

// ── Contract ──────────────────────────────────────────────────────────

pub trait Procedure: Send + fmt::Debug {
    /// Begin work. `completion` must be kept and consumed exactly once.
    fn start(&mut self, completion: Completion, params: GoalParams, out: &mut ProcedureOutput);

    /// Stop work as soon as possible. The procedure still reports through
    /// its completion token (immediately or once the stop is confirmed).
    fn cancel(&mut self, out: &mut ProcedureOutput);

    /// React to an indication, a timer or a handover outcome.
    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput);
}

/// Once-only right to report the end of one procedure run.
///
/// Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct Completion {
    goal: GoalId,
    run: RunId,
}

impl Completion {
    pub(crate) fn new(goal: GoalId, run: RunId) -> Self {
        Self { goal, run }
    }

    pub fn goal(&self) -> GoalId {
        self.goal
    }

    pub fn finish(self, result: ProcedureResult) -> Terminal {
        Terminal {
            goal: self.goal,
            run: self.run,
            result,
        }
    }
}

/// Terminal report produced by consuming a [`Completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    goal: GoalId,
    run: RunId,
    result: ProcedureResult,
}

impl Terminal {
    pub fn goal(&self) -> GoalId {
        self.goal
    }

    pub fn run(&self) -> RunId {
        self.run
    }

    pub fn result(&self) -> ProcedureResult {
        self.result
    }
}

/// Timers a procedure can arm. One of each kind per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bound on an external confirmation.
    Confirm,
    /// Reconnect suspended while multipoint audio plays.
    AudioWait,
    /// Delay before re-attempting a handover.
    Retry,
}

/// Input delivered to an active procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureInput {
    Indication(Indication),
    Timer(TimerKind),
    Handover(HandoverOutcome),
    /// The reason behind a pending handover no longer holds.
    HandoverWithdrawn,
}

/// Side effect requested by a procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcedureEffect {
    Request(ServiceRequest),
    StartTimer { kind: TimerKind, after: Duration },
    CancelTimer { kind: TimerKind },
    StartHandover { reason: HandoverReason },
    CancelHandover,
}

/// Everything one procedure call produced.
#[derive(Debug, Default)]
pub struct ProcedureOutput {
    pub(crate) effects: Vec<ProcedureEffect>,
    pub(crate) started: Option<bool>,
    pub(crate) terminal: Option<Terminal>,
}

impl ProcedureOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, request: ServiceRequest) {
        self.effects.push(ProcedureEffect::Request(request));
    }

    pub fn start_timer(&mut self, kind: TimerKind, after: Duration) {
        self.effects.push(ProcedureEffect::StartTimer { kind, after });
    }

    pub fn cancel_timer(&mut self, kind: TimerKind) {
        self.effects.push(ProcedureEffect::CancelTimer { kind });
    }

    pub fn push(&mut self, effect: ProcedureEffect) {
        self.effects.push(effect);
    }

    /// Acknowledge the start. Defaults to success when never called.
    pub fn ack_start(&mut self, ok: bool) {
        self.started = Some(ok);
    }

    pub fn finish(&mut self, terminal: Terminal) {
        debug_assert!(self.terminal.is_none(), "one completion token per run");
        self.terminal = Some(terminal);
    }

    pub fn effects(&self) -> &[ProcedureEffect] {
        &self.effects
    }

    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal
    }
}

/// Finish through the token if it is still held.
pub(crate) fn finish_once(
    completion: &mut Option<Completion>,
    result: ProcedureResult,
    out: &mut ProcedureOutput,
) {
    if let Some(token) = completion.take() {
        out.finish(token.finish(result));
    }
}

// ── Factory ───────────────────────────────────────────────────────────

/// Build the procedure that implements `goal`.
pub fn build(goal: GoalId, config: &TopologyConfig) -> Box<dyn Procedure> {
    let confirm = config.confirm_timeout;
    match goal {
        GoalId::SystemStop => Box::new(Sequence::new(
            "system_stop",
            vec![
                Step::configure(Setting::HandsetConnectable, false),
                Step::configure(Setting::HandsetConnectAllowed, false),
                Step::configure(Setting::LeConnectionAllowed, false),
                Step::new(ServiceRequest::DisconnectHandsets, Expect::HandsetsDisconnected),
            ],
            confirm,
        )),
        GoalId::NoRoleIdle => Box::new(Sequence::new(
            "no_role_idle",
            vec![
                Step::configure(Setting::HandsetConnectable, false),
                Step::configure(Setting::HandsetConnectAllowed, false),
            ],
            confirm,
        )),
        GoalId::AllowLeConnection => Box::new(Sequence::setting(
            "allow_le_connection",
            Setting::LeConnectionAllowed,
            confirm,
        )),
        GoalId::ConnectableHandset => Box::new(Sequence::setting(
            "connectable_handset",
            Setting::HandsetConnectable,
            confirm,
        )),
        GoalId::AllowHandsetConnect => Box::new(Sequence::setting(
            "allow_handset_connect",
            Setting::HandsetConnectAllowed,
            confirm,
        )),
        GoalId::DisconnectPeerProfiles => Box::new(Sequence::new(
            "disconnect_peer_profiles",
            vec![Step::new(
                ServiceRequest::DisconnectPeerProfiles,
                Expect::PeerProfilesDisconnected,
            )],
            confirm,
        )),
        GoalId::FindRole => Box::new(FindRole::new(config.find_role_timeout)),
        GoalId::ConnectPeerProfiles => Box::new(ConnectPeerProfiles::new(confirm)),
        GoalId::ConnectHandset => Box::new(ConnectHandset::new(
            config.auto_connect_profiles,
            config.handset_audio_wait,
            confirm,
        )),
        GoalId::DisconnectHandset => Box::new(DisconnectHandset::all(confirm)),
        GoalId::DisconnectLruHandset => Box::new(DisconnectHandset::lru(confirm)),
        GoalId::DynamicHandover => Box::new(DynamicHandover::new(
            config.handover_max_retries,
            config.handover_retry_delay,
        )),
    }
}
