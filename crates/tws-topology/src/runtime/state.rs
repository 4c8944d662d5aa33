/// Pure topology state for one earbud.
///
/// Owns the Event Set and rule engine, the goal executor, the handover
/// coordinator and the handset table. Every `handle_*` entry point applies
/// its input, runs the rule engine until no rule fires any more, and returns
/// the effects for the executor. No I/O, no clocks.
use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};
use tws_metrics::TopologyMetrics;

use crate::config::TopologyConfig;
use crate::decision::{Decision, HandoverDecider};
use crate::error::HandoverError;
use crate::events::RuleEvents;
use crate::goals::{GoalEvent, GoalExecutor, GoalId, GoalOutput, GoalSnapshot, RequestOutcome, RunId};
use crate::handover::{
    Direction, HandoverAction, HandoverCoordinator, HandoverMessage, HandoverOutcome,
    ParticipantRegistry,
};
use crate::procedures::{self, ProcedureEffect, ProcedureInput};
use crate::protocol::PeerMessage;
use crate::rules::{RuleEngine, TopologyView, RULES};
use crate::services::{Indication, ServiceRequest};
use crate::types::{DeviceId, DeviceTable, HandoverReason, Role};

use super::effect::{DeliveryTag, TopologyEffect};
use super::timers::{TimerOwner, TimerTable, TimerToken};
use super::{TopologyCommand, TopologyEvent};

/// Evaluation passes allowed per entry point before giving up on settling.
const MAX_PASSES: usize = 32;

/// Requests only a handset owner acts on.
const PRIMARY_EVENTS: RuleEvents = RuleEvents::from_bits(
    RuleEvents::HANDSET_LINKLOSS.bits()
        | RuleEvents::USER_REQUEST_CONNECT_HANDSET.bits()
        | RuleEvents::USER_REQUEST_DISCONNECT_ALL_HANDSETS.bits()
        | RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET.bits()
        | RuleEvents::HANDOVER_REQUESTED.bits()
        | RuleEvents::HANDOVER_FAILED.bits(),
);

/// Satisfied once every reachable handset is connected.
const CONNECT_REQUESTS: RuleEvents = RuleEvents::from_bits(
    RuleEvents::HANDSET_LINKLOSS.bits()
        | RuleEvents::USER_REQUEST_CONNECT_HANDSET.bits()
        | RuleEvents::HANDOVER_FAILED.bits(),
);

/// Satisfied once no handset is connected.
const DISCONNECT_REQUESTS: RuleEvents = RuleEvents::from_bits(
    RuleEvents::USER_REQUEST_DISCONNECT_ALL_HANDSETS.bits()
        | RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET.bits(),
);

// ── Link leases ───────────────────────────────────────────────────────

/// Handset links held open for a handover commit. At most one retain per
/// device is outstanding with the connection manager.
#[derive(Debug, Default)]
pub struct LinkLeases {
    held: HashSet<DeviceId>,
}

impl LinkLeases {
    /// Returns `false` if the link was already retained.
    pub fn retain(&mut self, device: DeviceId) -> bool {
        self.held.insert(device)
    }

    /// Returns `false` if the link was not retained.
    pub fn release(&mut self, device: DeviceId) -> bool {
        self.held.remove(&device)
    }

    pub fn is_held(&self, device: DeviceId) -> bool {
        self.held.contains(&device)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

// ── TopologyState ─────────────────────────────────────────────────────

pub struct TopologyState {
    config: TopologyConfig,
    role: Role,
    started: bool,
    stopping: bool,
    peer_paired: bool,
    peer_link_up: bool,
    peer_profiles_connected: bool,
    prohibit_connect: bool,
    audio_streaming: bool,
    handover_reason: Option<HandoverReason>,
    handsets: DeviceTable,
    rules: RuleEngine<TopologyView>,
    goals: GoalExecutor,
    handover: HandoverCoordinator,
    decider: HandoverDecider,
    /// Observation time the armed decision recheck stands for.
    decision_at: Option<Duration>,
    timers: TimerTable,
    leases: LinkLeases,
    metrics: TopologyMetrics,
}

impl TopologyState {
    pub fn new(registry: ParticipantRegistry, config: TopologyConfig) -> Self {
        let procedure_config = config.clone();
        let goals = GoalExecutor::new(Box::new(move |goal| {
            procedures::build(goal, &procedure_config)
        }));
        let handover = HandoverCoordinator::new(
            registry,
            config.marshal_chunk_size,
            config.protocol_timeout,
        );
        let decider = HandoverDecider::new(config.decision.clone());
        Self {
            config,
            role: Role::None,
            started: false,
            stopping: false,
            peer_paired: false,
            peer_link_up: false,
            peer_profiles_connected: false,
            prohibit_connect: false,
            audio_streaming: false,
            handover_reason: None,
            handsets: DeviceTable::new(),
            rules: RuleEngine::new(&RULES),
            goals,
            handover,
            decider,
            decision_at: None,
            timers: TimerTable::new(),
            leases: LinkLeases::default(),
            metrics: TopologyMetrics::new(),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn events(&self) -> RuleEvents {
        self.rules.events()
    }

    pub fn goals(&self) -> GoalSnapshot {
        self.goals.snapshot()
    }

    pub fn handsets(&self) -> &DeviceTable {
        &self.handsets
    }

    pub fn leases(&self) -> &LinkLeases {
        &self.leases
    }

    pub fn handover_active(&self) -> bool {
        self.handover.is_active()
    }

    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }

    pub fn decider(&self) -> &HandoverDecider {
        &self.decider
    }

    fn view(&self) -> TopologyView {
        TopologyView {
            role: self.role,
            stopping: self.stopping,
            peer_paired: self.peer_paired,
            peer_link_up: self.peer_link_up,
            peer_profiles_connected: self.peer_profiles_connected,
            handsets_paired: self.handsets.paired_count(),
            handsets_connected: self.handsets.connected_count(),
            max_handsets: self.config.max_handsets,
            prohibit_connect: self.prohibit_connect,
            audio_streaming: self.audio_streaming,
            dynamic_handover: self.config.dynamic_handover,
            auto_connect_profiles: self.config.auto_connect_profiles,
            handover_reason: self.handover_reason,
            goals: self.goals.snapshot(),
        }
    }

    // ── Entry points ──────────────────────────────────────────────────

    pub fn handle_command(&mut self, cmd: TopologyCommand) -> Vec<TopologyEffect> {
        let mut effects = Vec::new();
        match cmd {
            TopologyCommand::Start => {
                if self.started {
                    debug!("topology already started");
                    return effects;
                }
                info!("topology starting");
                self.started = true;
                self.stopping = false;
                effects.push(TopologyEffect::Emit(TopologyEvent::Started));
                self.rules.set_event(RuleEvents::START);
            }
            TopologyCommand::Stop => {
                if !self.started || self.stopping {
                    debug!(started = self.started, "stop ignored");
                    return effects;
                }
                info!("topology stopping");
                self.stopping = true;
                for goal in self.goals.clear_queue() {
                    self.rules.abandon(goal);
                }
                self.rules.set_event(RuleEvents::STOP);
            }
            TopologyCommand::ConnectHandset => {
                self.rules.set_event(RuleEvents::USER_REQUEST_CONNECT_HANDSET);
            }
            TopologyCommand::DisconnectAllHandsets => {
                if self.nothing_to_disconnect() {
                    debug!("nothing to disconnect");
                    return effects;
                }
                self.rules
                    .set_event(RuleEvents::USER_REQUEST_DISCONNECT_ALL_HANDSETS);
            }
            TopologyCommand::DisconnectLruHandset => {
                if self.nothing_to_disconnect() {
                    debug!("nothing to disconnect");
                    return effects;
                }
                self.rules
                    .set_event(RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET);
            }
            TopologyCommand::ProhibitHandsetConnection { prohibit } => {
                info!(prohibit, "handset connection policy changed");
                self.prohibit_connect = prohibit;
                self.rules.set_event(RuleEvents::PROHIBIT_CONNECT_TO_HANDSET);
                if !prohibit {
                    self.rules.set_event(RuleEvents::USER_REQUEST_CONNECT_HANDSET);
                }
            }
            TopologyCommand::RequestHandover { reason } => {
                info!(?reason, "handover requested");
                self.handover_reason = Some(reason);
                self.rules.set_event(RuleEvents::HANDOVER_REQUESTED);
            }
            TopologyCommand::Indicate(indication) => return self.handle_indication(indication),
            TopologyCommand::GetRole { reply } => {
                let _ = reply.send(self.role);
                return effects;
            }
            TopologyCommand::GetGoals { reply } => {
                let _ = reply.send(self.goals.snapshot());
                return effects;
            }
            TopologyCommand::GetEvents { reply } => {
                let _ = reply.send(self.rules.events());
                return effects;
            }
            TopologyCommand::GetMetrics { reply } => {
                let _ = reply.send(self.metrics.clone());
                return effects;
            }
            // Handled by the loop.
            TopologyCommand::Shutdown => return effects,
        }
        self.settle(&mut effects);
        effects
    }

    /// Confirmation or unsolicited indication from an external service.
    pub fn handle_indication(&mut self, indication: Indication) -> Vec<TopologyEffect> {
        let mut effects = Vec::new();
        self.apply_indication(&indication, &mut effects);
        let outputs = self.goals.deliver(&ProcedureInput::Indication(indication));
        self.apply_goal_outputs(outputs, &mut effects);
        self.settle(&mut effects);
        effects
    }

    /// Inbound frame from the peer channel.
    pub fn handle_peer_bytes(&mut self, data: &[u8]) -> Vec<TopologyEffect> {
        let mut effects = Vec::new();
        match PeerMessage::from_bytes(data) {
            Ok(PeerMessage::Handover(message)) => {
                debug!(kind = message.kind(), session = message.session(), "peer message");
                let actions = self.handover.handle_message(message, self.role);
                self.apply_handover_actions(actions, &mut effects);
            }
            Err(e) => {
                warn!(error = %e, len = data.len(), "undecodable peer frame dropped");
                effects.push(TopologyEffect::Emit(TopologyEvent::Error {
                    description: format!("bad peer frame: {e}"),
                }));
            }
        }
        self.settle(&mut effects);
        effects
    }

    /// Delivery report for a tagged peer send.
    pub fn handle_delivery(&mut self, tag: DeliveryTag, ok: bool) -> Vec<TopologyEffect> {
        let mut effects = Vec::new();
        let actions = self.handover.delivery(tag.session, tag.commit, ok);
        self.apply_handover_actions(actions, &mut effects);
        self.settle(&mut effects);
        effects
    }

    pub fn handle_timer(&mut self, token: TimerToken) -> Vec<TopologyEffect> {
        let mut effects = Vec::new();
        let Some(owner) = self.timers.fire(token) else {
            debug!(owner = ?token.owner(), "stale timer dropped");
            return effects;
        };
        match owner {
            TimerOwner::Goal { goal, run, kind } => {
                debug!(?goal, ?kind, "procedure timer fired");
                let outputs = self.goals.deliver_to(run, &ProcedureInput::Timer(kind));
                self.apply_goal_outputs(outputs, &mut effects);
            }
            TimerOwner::Handover { session } => {
                let actions = self.handover.timeout(session);
                self.apply_handover_actions(actions, &mut effects);
            }
            TimerOwner::Decision => {
                if let Some(at) = self.decision_at.take() {
                    let decision = self.decider.update(at);
                    self.apply_decision(decision, &mut effects);
                    self.schedule_recheck(at, &mut effects);
                }
            }
        }
        self.settle(&mut effects);
        effects
    }

    // ── Rule evaluation ───────────────────────────────────────────────

    /// Evaluate the rules and request their goals until a pass fires nothing.
    fn settle(&mut self, effects: &mut Vec<TopologyEffect>) {
        if !self.started {
            return;
        }
        for _ in 0..MAX_PASSES {
            let view = self.view();
            let requests = self.rules.evaluate(&view);
            if requests.is_empty() {
                return;
            }
            for request in requests {
                let (outcome, outputs) = self.goals.request(request.goal, request.params);
                if outcome == RequestOutcome::Ignored {
                    debug!(goal = ?request.goal, "rule waits on the pending goal");
                }
                self.apply_goal_outputs(outputs, effects);
            }
        }
        warn!(passes = MAX_PASSES, events = ?self.rules.events(), "rule evaluation did not settle");
    }

    // ── Indications ───────────────────────────────────────────────────

    fn apply_indication(&mut self, indication: &Indication, effects: &mut Vec<TopologyEffect>) {
        match *indication {
            Indication::RoleFound { role } => self.set_role(role, effects),
            Indication::PeerPaired => self.peer_paired = true,
            Indication::PeerLinkUp => {
                self.peer_paired = true;
                if !self.peer_link_up {
                    info!("peer link up");
                    self.peer_link_up = true;
                    self.rules.set_event(RuleEvents::PEER_CONNECTED);
                }
            }
            Indication::PeerLinkDown => {
                if self.peer_link_up {
                    info!("peer link down");
                    self.peer_link_up = false;
                    self.rules.set_event(RuleEvents::PEER_DISCONNECTED);
                }
                let actions = self.handover.peer_link_lost();
                self.apply_handover_actions(actions, effects);
                // Link metrics and recommendations were relative to a peer that is gone.
                self.forget_decision();
                self.rules.reset_event(RuleEvents::HANDOVER_REQUESTED);
                if !self.handover_pending() {
                    self.handover_reason = None;
                }
            }
            Indication::PeerProfilesConnected { ok } => {
                if ok {
                    self.peer_profiles_connected = true;
                    self.rules.reset_event(RuleEvents::FAILED_PEER_CONNECT);
                }
            }
            Indication::PeerProfilesDisconnected => self.peer_profiles_connected = false,
            Indication::HandsetPaired { device } => self.handsets.pair(device),
            Indication::HandsetConnected { device } => {
                if self.handsets.connect(device) {
                    info!(%device, "handset connected");
                    effects.push(TopologyEffect::Emit(TopologyEvent::HandsetConnected { device }));
                    self.drop_satisfied_connect_requests();
                }
            }
            Indication::HandsetDisconnected { device, link_loss } => {
                if self.handsets.disconnect(device) {
                    info!(%device, link_loss, "handset disconnected");
                    effects.push(TopologyEffect::Emit(TopologyEvent::HandsetDisconnected {
                        device,
                    }));
                    if link_loss && !self.role.is_secondary() {
                        self.rules.set_event(RuleEvents::HANDSET_LINKLOSS);
                    }
                    if self.handsets.connected_count() == 0 {
                        self.rules.reset_event(DISCONNECT_REQUESTS);
                    }
                }
            }
            Indication::AudioStarted => self.audio_streaming = true,
            Indication::AudioStopped => self.audio_streaming = false,
            Indication::Observed { at, observation } => {
                let decision = self.decider.observe(at, observation);
                self.apply_decision(decision, effects);
                self.schedule_recheck(at, effects);
            }
            Indication::Configured { .. }
            | Indication::ReconnectCfm { .. }
            | Indication::ReconnectStopped
            | Indication::DisconnectCfm { .. } => {}
        }
    }

    fn set_role(&mut self, role: Role, effects: &mut Vec<TopologyEffect>) {
        if self.role == role {
            return;
        }
        info!(from = %self.role, to = %role, "role changed");
        self.role = role;
        self.forget_decision();
        if role.is_secondary() {
            self.rules.reset_event(PRIMARY_EVENTS);
        }
        effects.push(TopologyEffect::Emit(TopologyEvent::RoleChanged { role }));
    }

    fn nothing_to_disconnect(&self) -> bool {
        self.role.is_secondary()
            || (self.handsets.connected_count() == 0
                && !self.goals.is_active(GoalId::ConnectHandset)
                && !self.goals.is_queued(GoalId::ConnectHandset))
    }

    fn drop_satisfied_connect_requests(&mut self) {
        let reachable = self.handsets.paired_count().min(self.config.max_handsets);
        if self.handsets.connected_count() >= reachable {
            self.rules.reset_event(CONNECT_REQUESTS);
        }
    }

    fn handover_pending(&self) -> bool {
        self.goals.is_active(GoalId::DynamicHandover) || self.goals.is_queued(GoalId::DynamicHandover)
    }

    // ── Handover decision ─────────────────────────────────────────────

    fn apply_decision(&mut self, decision: Decision, effects: &mut Vec<TopologyEffect>) {
        if decision == Decision::Unchanged {
            return;
        }
        if !self.role.is_primary() || !self.config.dynamic_handover {
            debug!(role = %self.role, ?decision, "handover decision not acted on");
            return;
        }
        match decision {
            Decision::Handover(recommendation) => {
                self.handover_reason = Some(recommendation.reason);
                self.rules.set_event(RuleEvents::HANDOVER_REQUESTED);
            }
            Decision::Withdraw => {
                self.rules.reset_event(RuleEvents::HANDOVER_REQUESTED);
                if !self.handover_pending() {
                    self.handover_reason = None;
                }
                let outputs = self.goals.deliver(&ProcedureInput::HandoverWithdrawn);
                self.apply_goal_outputs(outputs, effects);
            }
            Decision::Unchanged => {}
        }
    }

    fn schedule_recheck(&mut self, at: Duration, effects: &mut Vec<TopologyEffect>) {
        match self.decider.recheck_after(at) {
            Some(after) => {
                let token = self.timers.arm(TimerOwner::Decision);
                self.decision_at = Some(at + after);
                effects.push(TopologyEffect::StartTimer { token, after });
            }
            None => {
                self.timers.disarm(TimerOwner::Decision);
                self.decision_at = None;
            }
        }
    }

    fn forget_decision(&mut self) {
        self.decider.reset();
        self.timers.disarm(TimerOwner::Decision);
        self.decision_at = None;
    }

    // ── Goals ─────────────────────────────────────────────────────────

    fn apply_goal_outputs(&mut self, outputs: Vec<GoalOutput>, effects: &mut Vec<TopologyEffect>) {
        for output in outputs {
            match output {
                GoalOutput::Effect { goal, run, effect } => {
                    self.apply_procedure_effect(goal, run, effect, effects)
                }
                GoalOutput::Event(event) => self.on_goal_event(event, effects),
            }
        }
    }

    fn apply_procedure_effect(
        &mut self,
        goal: GoalId,
        run: RunId,
        effect: ProcedureEffect,
        effects: &mut Vec<TopologyEffect>,
    ) {
        match effect {
            ProcedureEffect::Request(request) => effects.push(TopologyEffect::Service(request)),
            ProcedureEffect::StartTimer { kind, after } => {
                let token = self.timers.arm(TimerOwner::Goal { goal, run, kind });
                effects.push(TopologyEffect::StartTimer { token, after });
            }
            ProcedureEffect::CancelTimer { kind } => {
                self.timers.disarm(TimerOwner::Goal { goal, run, kind });
            }
            ProcedureEffect::StartHandover { reason } => {
                let devices = self.handsets.connected();
                let actions = self.handover.start(reason, devices);
                self.apply_handover_actions(actions, effects);
            }
            ProcedureEffect::CancelHandover => {
                let actions = self.handover.cancel();
                self.apply_handover_actions(actions, effects);
            }
        }
    }

    fn on_goal_event(&mut self, event: GoalEvent, effects: &mut Vec<TopologyEffect>) {
        match event {
            GoalEvent::Started { goal, ok, .. } => {
                self.metrics.goals_started.inc();
                if !ok {
                    warn!(?goal, "goal failed to start");
                }
            }
            GoalEvent::Completed { goal, run, result } => {
                self.timers.disarm_run(run);
                self.rules.goal_finished(goal);
                let entry = goal.entry();
                if result.is_success() {
                    self.metrics.goals_succeeded.inc();
                    self.rules.set_event(entry.success_event);
                } else {
                    warn!(?goal, ?result, "goal failed");
                    self.metrics.goals_failed.inc();
                    self.rules.set_event(entry.failure_event);
                    if goal == GoalId::DynamicHandover {
                        self.drop_satisfied_connect_requests();
                    }
                    effects.push(TopologyEffect::Emit(TopologyEvent::GoalFailed { goal }));
                }
                self.after_goal(goal, effects);
            }
            GoalEvent::Cancelled { goal, run, .. } => {
                self.timers.disarm_run(run);
                self.metrics.goals_cancelled.inc();
                self.rules.goal_finished(goal);
                self.after_goal(goal, effects);
            }
            GoalEvent::Replaced { goal } => self.rules.goal_finished(goal),
        }
    }

    fn after_goal(&mut self, goal: GoalId, effects: &mut Vec<TopologyEffect>) {
        match goal {
            GoalId::SystemStop if self.stopping => {
                info!("topology stopped");
                self.started = false;
                self.stopping = false;
                self.rules.reset_event(self.rules.events());
                effects.push(TopologyEffect::Emit(TopologyEvent::Stopped));
            }
            GoalId::DynamicHandover => self.handover_reason = None,
            _ => {}
        }
    }

    // ── Handover ──────────────────────────────────────────────────────

    fn apply_handover_actions(
        &mut self,
        actions: Vec<HandoverAction>,
        effects: &mut Vec<TopologyEffect>,
    ) {
        for action in actions {
            match action {
                HandoverAction::Send { message, commit } => {
                    if let HandoverMessage::MarshalData { bytes, .. } = &message {
                        self.metrics.marshal_bytes.add(bytes.len() as u64);
                    }
                    let tag = DeliveryTag {
                        session: message.session(),
                        commit,
                    };
                    effects.push(TopologyEffect::SendPeer {
                        message: message.into(),
                        tag,
                    });
                }
                HandoverAction::StartTimer { session, after } => {
                    let token = self.timers.arm(TimerOwner::Handover { session });
                    effects.push(TopologyEffect::StartTimer { token, after });
                }
                HandoverAction::CancelTimer { session } => {
                    self.timers.disarm(TimerOwner::Handover { session });
                }
                HandoverAction::RetainLink(device) => {
                    if self.leases.retain(device) {
                        effects.push(TopologyEffect::Service(ServiceRequest::RetainLink { device }));
                    }
                }
                HandoverAction::ReleaseLink(device) => {
                    if self.leases.release(device) {
                        effects.push(TopologyEffect::Service(ServiceRequest::ReleaseLink { device }));
                    }
                }
                HandoverAction::Started {
                    session,
                    reason,
                    direction,
                } => {
                    info!(session, ?reason, ?direction, "handover session started");
                    self.metrics.handovers_started.inc();
                    effects.push(TopologyEffect::Emit(TopologyEvent::HandoverStarted {
                        session,
                        reason,
                    }));
                }
                HandoverAction::Finished {
                    direction,
                    devices,
                    outcome,
                } => self.handover_finished(direction, &devices, outcome, effects),
            }
        }
    }

    fn handover_finished(
        &mut self,
        direction: Direction,
        devices: &[DeviceId],
        outcome: HandoverOutcome,
        effects: &mut Vec<TopologyEffect>,
    ) {
        match &outcome {
            HandoverOutcome::Committed { session, role } => {
                self.metrics.handovers_committed.inc();
                self.move_handsets(*role, devices, effects);
                self.set_role(*role, effects);
                self.rules.set_event(RuleEvents::ROLE_SWITCH);
                effects.push(TopologyEffect::Emit(TopologyEvent::HandoverCompleted {
                    session: *session,
                    role: *role,
                }));
            }
            HandoverOutcome::Failed { session, error } => {
                match error {
                    HandoverError::Vetoed { .. } | HandoverError::PeerVetoed => {
                        self.metrics.handovers_vetoed.inc()
                    }
                    _ => self.metrics.handovers_aborted.inc(),
                }
                warn!(session, ?direction, %error, "handover failed");
                effects.push(TopologyEffect::Emit(TopologyEvent::HandoverFailed {
                    session: *session,
                    error: error.clone(),
                }));
            }
        }
        if direction == Direction::Outgoing {
            let outputs = self.goals.deliver(&ProcedureInput::Handover(outcome));
            self.apply_goal_outputs(outputs, effects);
        }
    }

    /// Handset ownership follows the committed role.
    fn move_handsets(&mut self, role: Role, devices: &[DeviceId], effects: &mut Vec<TopologyEffect>) {
        for &device in devices {
            if role.is_primary() {
                if self.handsets.connect(device) {
                    effects.push(TopologyEffect::Emit(TopologyEvent::HandsetConnected { device }));
                }
            } else {
                self.handsets.pair(device);
                self.handsets.disconnect(device);
            }
        }
        if !role.is_primary() {
            self.audio_streaming = false;
            self.peer_profiles_connected = false;
        }
        debug!(%role, devices = devices.len(), "handset ownership moved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Bud, Observation};
    use crate::goals::GoalState;
    use crate::services::Setting;
    use crate::types::Profiles;

    const PHONE: DeviceId = DeviceId::new(0);

    fn default_state() -> TopologyState {
        TopologyState::new(ParticipantRegistry::new(), TopologyConfig::default())
    }

    fn requests(effects: &[TopologyEffect]) -> Vec<ServiceRequest> {
        effects
            .iter()
            .filter_map(|e| match e {
                TopologyEffect::Service(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn emitted(effects: &[TopologyEffect]) -> Vec<TopologyEvent> {
        effects
            .iter()
            .filter_map(|e| match e {
                TopologyEffect::Emit(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    fn timer_for(effects: &[TopologyEffect], goal: GoalId) -> TimerToken {
        effects
            .iter()
            .find_map(|e| match e {
                TopologyEffect::StartTimer { token, .. } => match token.owner() {
                    TimerOwner::Goal { goal: g, .. } if g == goal => Some(*token),
                    _ => None,
                },
                _ => None,
            })
            .expect("no timer armed for goal")
    }

    /// Answer every request like a healthy stack with one phone in range,
    /// feeding the answers back until the state goes quiet.
    fn respond(state: &mut TopologyState, effects: Vec<TopologyEffect>) -> Vec<TopologyEffect> {
        let mut all = Vec::new();
        let mut pending = effects;
        while !pending.is_empty() {
            let mut next = Vec::new();
            for request in requests(&pending) {
                let answers = match request {
                    ServiceRequest::Configure { setting, .. } => {
                        vec![Indication::Configured { setting }]
                    }
                    ServiceRequest::ReconnectHandset { .. } => vec![
                        Indication::HandsetConnected { device: PHONE },
                        Indication::ReconnectCfm { ok: true },
                    ],
                    ServiceRequest::StopReconnect => vec![Indication::ReconnectStopped],
                    ServiceRequest::DisconnectHandsets => vec![
                        Indication::HandsetDisconnected {
                            device: PHONE,
                            link_loss: false,
                        },
                        Indication::DisconnectCfm { lru: false, ok: true },
                    ],
                    ServiceRequest::ConnectPeerProfiles => {
                        vec![Indication::PeerProfilesConnected { ok: true }]
                    }
                    ServiceRequest::DisconnectPeerProfiles => {
                        vec![Indication::PeerProfilesDisconnected]
                    }
                    _ => Vec::new(),
                };
                for indication in answers {
                    next.extend(state.handle_indication(indication));
                }
            }
            all.append(&mut pending);
            pending = next;
        }
        all
    }

    fn confirm_settings(state: &mut TopologyState) {
        for setting in [
            Setting::LeConnectionAllowed,
            Setting::HandsetConnectable,
            Setting::HandsetConnectAllowed,
        ] {
            state.handle_indication(Indication::Configured { setting });
        }
    }

    fn started_standalone() -> TopologyState {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        let effects = state.handle_command(TopologyCommand::Start);
        respond(&mut state, effects);
        state
    }

    #[test]
    fn indications_before_start_run_no_rules() {
        let mut state = default_state();
        let effects = state.handle_indication(Indication::HandsetDisconnected {
            device: PHONE,
            link_loss: true,
        });
        assert!(effects.is_empty());
        assert!(state.goals().goals.is_empty());
    }

    #[test]
    fn start_without_peer_connects_paired_handset() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });

        let effects = state.handle_command(TopologyCommand::Start);
        assert!(matches!(
            emitted(&effects)[0],
            TopologyEvent::Started
        ));
        assert_eq!(
            requests(&effects),
            vec![
                ServiceRequest::Configure {
                    setting: Setting::LeConnectionAllowed,
                    enable: true
                },
                ServiceRequest::Configure {
                    setting: Setting::HandsetConnectable,
                    enable: true
                },
                ServiceRequest::Configure {
                    setting: Setting::HandsetConnectAllowed,
                    enable: true
                },
                ServiceRequest::ReconnectHandset {
                    profiles: Profiles::HFP | Profiles::A2DP
                },
            ]
        );

        let all = respond(&mut state, effects);
        assert!(emitted(&all).contains(&TopologyEvent::HandsetConnected { device: PHONE }));
        assert!(state.handsets().is_connected(PHONE));
        assert!(state.goals().goals.is_empty());
        assert_eq!(state.events(), RuleEvents::NONE);
        assert_eq!(state.metrics().goals_started.get(), 4);
        assert_eq!(state.metrics().goals_succeeded.get(), 4);
    }

    #[test]
    fn settings_run_once_while_connect_is_outstanding() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);
        assert!(state.goals().is_active(GoalId::ConnectHandset));
        assert!(state.events().contains(RuleEvents::START), "still held by the connect");

        let effects = state.handle_indication(Indication::AudioStarted);
        assert!(requests(&effects).is_empty());
        assert_eq!(state.metrics().goals_started.get(), 4);
    }

    #[test]
    fn start_twice_is_a_no_op() {
        let mut state = started_standalone();
        assert!(state.handle_command(TopologyCommand::Start).is_empty());
    }

    #[test]
    fn paired_peer_waits_for_role_before_handset_goals() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(Indication::PeerPaired);

        let effects = state.handle_command(TopologyCommand::Start);
        assert_eq!(requests(&effects), vec![ServiceRequest::FindRole]);
        assert!(state.events().contains(RuleEvents::START), "settings rules are deferred");

        let effects = state.handle_indication(Indication::RoleFound { role: Role::Primary });
        assert!(emitted(&effects).contains(&TopologyEvent::RoleChanged { role: Role::Primary }));
        assert!(requests(&effects).contains(&ServiceRequest::ReconnectHandset {
            profiles: Profiles::HFP | Profiles::A2DP
        }));
        assert_eq!(state.role(), Role::Primary);
    }

    #[test]
    fn secondary_role_disables_connectability() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(Indication::PeerPaired);
        state.handle_command(TopologyCommand::Start);

        let effects = state.handle_indication(Indication::RoleFound {
            role: Role::Secondary,
        });
        let reqs = requests(&effects);
        assert!(reqs.contains(&ServiceRequest::Configure {
            setting: Setting::HandsetConnectable,
            enable: false
        }));
        assert!(!reqs.iter().any(|r| matches!(r, ServiceRequest::ReconnectHandset { .. })));
    }

    #[test]
    fn role_discovery_timeout_goes_idle() {
        let mut state = default_state();
        state.handle_indication(Indication::PeerPaired);
        let effects = state.handle_command(TopologyCommand::Start);
        let token = timer_for(&effects, GoalId::FindRole);

        let effects = state.handle_timer(token);
        assert!(emitted(&effects).contains(&TopologyEvent::GoalFailed {
            goal: GoalId::FindRole
        }));
        assert!(requests(&effects).contains(&ServiceRequest::Configure {
            setting: Setting::HandsetConnectable,
            enable: false
        }));
        respond(&mut state, effects);
        assert!(state.goals().goals.is_empty());
        assert_eq!(state.events(), RuleEvents::NONE);
        assert_eq!(state.role(), Role::None);
    }

    #[test]
    fn stale_timer_is_dropped() {
        let mut state = default_state();
        state.handle_indication(Indication::PeerPaired);
        let effects = state.handle_command(TopologyCommand::Start);
        let token = timer_for(&effects, GoalId::FindRole);
        state.handle_indication(Indication::RoleFound { role: Role::Primary });

        assert!(state.handle_timer(token).is_empty());
    }

    #[test]
    fn user_disconnect_cancels_pending_connect() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);
        assert!(state.goals().is_active(GoalId::ConnectHandset));

        let effects = state.handle_command(TopologyCommand::DisconnectAllHandsets);
        assert_eq!(requests(&effects), vec![ServiceRequest::StopReconnect]);
        let snapshot = state.goals();
        assert_eq!(snapshot.state_of(GoalId::ConnectHandset), Some(GoalState::Cancelling));
        assert!(snapshot.is_queued(GoalId::DisconnectHandset));

        let effects = state.handle_indication(Indication::ReconnectStopped);
        assert_eq!(requests(&effects), vec![ServiceRequest::DisconnectHandsets]);

        respond(&mut state, effects);
        assert!(state.goals().goals.is_empty());
        assert_eq!(state.metrics().goals_cancelled.get(), 1);
        assert_eq!(state.events(), RuleEvents::NONE, "cancelled connect is not retried");
    }

    #[test]
    fn lru_disconnect_waits_for_connect() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);
        state.handle_indication(Indication::HandsetConnected { device: PHONE });

        let effects = state.handle_command(TopologyCommand::DisconnectLruHandset);
        assert!(requests(&effects).is_empty());
        assert!(state
            .events()
            .contains(RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET));

        let effects = state.handle_indication(Indication::ReconnectCfm { ok: true });
        assert!(requests(&effects).contains(&ServiceRequest::DisconnectLruHandset));
    }

    #[test]
    fn link_loss_reconnects_when_primary() {
        let mut state = started_standalone();
        let effects = state.handle_indication(Indication::HandsetDisconnected {
            device: PHONE,
            link_loss: true,
        });
        assert!(emitted(&effects).contains(&TopologyEvent::HandsetDisconnected { device: PHONE }));
        assert!(requests(&effects).contains(&ServiceRequest::ReconnectHandset {
            profiles: Profiles::HFP | Profiles::A2DP
        }));
    }

    #[test]
    fn failed_connect_is_not_retried_until_triggered_again() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_command(TopologyCommand::Start);

        let effects = state.handle_indication(Indication::ReconnectCfm { ok: false });
        assert!(emitted(&effects).contains(&TopologyEvent::GoalFailed {
            goal: GoalId::ConnectHandset
        }));
        assert!(!state.goals().is_pending(GoalId::ConnectHandset));

        let effects = state.handle_command(TopologyCommand::ConnectHandset);
        assert!(requests(&effects).contains(&ServiceRequest::ReconnectHandset {
            profiles: Profiles::HFP | Profiles::A2DP
        }));
    }

    #[test]
    fn prohibit_disconnects_and_allow_reconnects() {
        let mut state = started_standalone();
        let effects = state.handle_command(TopologyCommand::ProhibitHandsetConnection {
            prohibit: true,
        });
        let reqs = requests(&effects);
        assert!(reqs.contains(&ServiceRequest::DisconnectHandsets));
        assert!(reqs.contains(&ServiceRequest::Configure {
            setting: Setting::HandsetConnectAllowed,
            enable: false
        }));
        respond(&mut state, effects);
        assert!(!state.handsets().is_connected(PHONE));

        let effects = state.handle_command(TopologyCommand::ProhibitHandsetConnection {
            prohibit: false,
        });
        let all = respond(&mut state, effects);
        assert!(requests(&all).contains(&ServiceRequest::ReconnectHandset {
            profiles: Profiles::HFP | Profiles::A2DP
        }));
        assert!(state.handsets().is_connected(PHONE));
    }

    #[test]
    fn stop_runs_system_stop_then_reports_stopped() {
        let mut state = started_standalone();
        let effects = state.handle_command(TopologyCommand::Stop);
        assert_eq!(
            requests(&effects)[0],
            ServiceRequest::Configure {
                setting: Setting::HandsetConnectable,
                enable: false
            }
        );
        let all = respond(&mut state, effects);
        assert!(emitted(&all).contains(&TopologyEvent::Stopped));
        assert!(!state.is_started());
        assert_eq!(state.events(), RuleEvents::NONE);

        // Not started: user requests are remembered but run nothing.
        let effects = state.handle_command(TopologyCommand::ConnectHandset);
        assert!(requests(&effects).is_empty());
    }

    #[test]
    fn handover_request_ignored_without_peer() {
        let mut state = started_standalone();
        let effects = state.handle_command(TopologyCommand::RequestHandover {
            reason: HandoverReason::InCase,
        });
        assert!(effects.is_empty());
        assert!(!state.handover_active());
        assert_eq!(
            state.events(),
            RuleEvents::HANDOVER_REQUESTED,
            "kept until a peer can take the role"
        );
    }

    #[test]
    fn handover_vetoed_locally_is_retried_then_fails() {
        use crate::handover::{HandoverParticipant, MarshalError, MarshalProgress};

        struct Busy;
        impl HandoverParticipant for Busy {
            fn name(&self) -> &'static str {
                "busy"
            }
            fn veto(&self) -> bool {
                true
            }
            fn marshal(&mut self, _: DeviceId, _: &mut [u8]) -> Result<MarshalProgress, MarshalError> {
                Ok(MarshalProgress::NOTHING)
            }
            fn unmarshal(&mut self, _: DeviceId, _: &[u8]) -> Result<MarshalProgress, MarshalError> {
                Ok(MarshalProgress::NOTHING)
            }
            fn commit(&mut self, _: DeviceId, _: bool) {}
            fn complete(&mut self, _: bool) {}
            fn abort(&mut self) {}
        }

        let config = TopologyConfig::default().handover_max_retries(1);
        let mut state = TopologyState::new(ParticipantRegistry::new().with(Busy), config);
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(Indication::PeerLinkUp);
        let effects = state.handle_command(TopologyCommand::Start);
        respond(&mut state, effects);
        let effects = state.handle_indication(Indication::RoleFound { role: Role::Primary });
        respond(&mut state, effects);
        assert!(state.handsets().is_connected(PHONE));

        let effects = state.handle_command(TopologyCommand::RequestHandover {
            reason: HandoverReason::BatteryLevel,
        });
        assert!(emitted(&effects)
            .iter()
            .any(|e| matches!(e, TopologyEvent::HandoverFailed { .. })));
        let retry = timer_for(&effects, GoalId::DynamicHandover);

        let effects = state.handle_timer(retry);
        assert!(emitted(&effects).contains(&TopologyEvent::GoalFailed {
            goal: GoalId::DynamicHandover
        }));
        assert_eq!(state.role(), Role::Primary);
        assert_eq!(state.metrics().handovers_vetoed.get(), 2);
    }

    #[test]
    fn leases_allow_one_retain_per_device() {
        let mut leases = LinkLeases::default();
        assert!(leases.retain(PHONE));
        assert!(!leases.retain(PHONE));
        assert!(leases.is_held(PHONE));
        assert!(leases.release(PHONE));
        assert!(!leases.release(PHONE));
        assert!(leases.is_empty());
    }

    const TABLET: DeviceId = DeviceId::new(1);

    /// Standalone with both handsets connected and the connect goal done.
    fn two_handsets_connected() -> TopologyState {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(Indication::HandsetPaired { device: TABLET });
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);
        state.handle_indication(Indication::HandsetConnected { device: PHONE });
        state.handle_indication(Indication::HandsetConnected { device: TABLET });
        state.handle_indication(Indication::ReconnectCfm { ok: true });
        assert!(state.goals().goals.is_empty());
        state
    }

    #[test]
    fn link_loss_while_streaming_reconnects_once_audio_stops() {
        let mut state = two_handsets_connected();
        state.handle_indication(Indication::AudioStarted);

        let effects = state.handle_indication(Indication::HandsetDisconnected {
            device: TABLET,
            link_loss: true,
        });
        assert!(requests(&effects).is_empty(), "audio from the other handset is not disturbed");
        assert!(state.events().contains(RuleEvents::HANDSET_LINKLOSS));

        let effects = state.handle_indication(Indication::AudioStopped);
        assert_eq!(
            requests(&effects),
            vec![ServiceRequest::ReconnectHandset {
                profiles: Profiles::HFP | Profiles::A2DP
            }]
        );
    }

    #[test]
    fn reconnected_handsets_clear_connect_requests() {
        let mut state = two_handsets_connected();
        state.handle_indication(Indication::AudioStarted);
        state.handle_indication(Indication::HandsetDisconnected {
            device: TABLET,
            link_loss: true,
        });
        // The phone stack brings the tablet back on its own.
        state.handle_indication(Indication::HandsetConnected { device: TABLET });
        assert!(!state.events().contains(RuleEvents::HANDSET_LINKLOSS));

        let effects = state.handle_indication(Indication::AudioStopped);
        assert!(requests(&effects).is_empty());
    }

    #[test]
    fn prohibit_can_be_toggled_repeatedly() {
        let mut state = started_standalone();
        for _ in 0..2 {
            let effects = state.handle_command(TopologyCommand::ProhibitHandsetConnection {
                prohibit: true,
            });
            assert!(requests(&effects).contains(&ServiceRequest::DisconnectHandsets));
            respond(&mut state, effects);

            let effects = state.handle_command(TopologyCommand::ProhibitHandsetConnection {
                prohibit: false,
            });
            assert!(requests(&effects).contains(&ServiceRequest::Configure {
                setting: Setting::HandsetConnectAllowed,
                enable: true
            }));
            respond(&mut state, effects);
            assert!(state.handsets().is_connected(PHONE));
        }
        assert_eq!(state.events(), RuleEvents::NONE);
    }

    #[test]
    fn secondary_role_drops_handset_requests() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(Indication::PeerPaired);
        state.handle_command(TopologyCommand::Start);
        state.handle_command(TopologyCommand::ConnectHandset);
        assert!(state.events().contains(RuleEvents::USER_REQUEST_CONNECT_HANDSET));

        state.handle_indication(Indication::RoleFound {
            role: Role::Secondary,
        });
        assert!(!state.events().intersects(PRIMARY_EVENTS));
    }

    #[test]
    fn disconnect_with_nothing_connected_is_dropped() {
        let mut state = default_state();
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);

        assert!(state
            .handle_command(TopologyCommand::DisconnectAllHandsets)
            .is_empty());
        assert!(state
            .handle_command(TopologyCommand::DisconnectLruHandset)
            .is_empty());
        assert!(!state.events().intersects(DISCONNECT_REQUESTS));
    }

    #[test]
    fn last_handset_leaving_clears_deferred_lru_request() {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_command(TopologyCommand::Start);
        confirm_settings(&mut state);
        state.handle_indication(Indication::HandsetConnected { device: PHONE });
        state.handle_command(TopologyCommand::DisconnectLruHandset);

        state.handle_indication(Indication::HandsetDisconnected {
            device: PHONE,
            link_loss: false,
        });
        assert!(!state
            .events()
            .contains(RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET));
        let effects = state.handle_indication(Indication::ReconnectCfm { ok: true });
        assert!(!requests(&effects).contains(&ServiceRequest::DisconnectLruHandset));
    }

    // ── Handover decision ─────────────────────────────────────────────

    fn observed(secs: u64, observation: Observation) -> Indication {
        Indication::Observed {
            at: Duration::from_secs(secs),
            observation,
        }
    }

    fn in_case(secs: u64, in_case: bool) -> Indication {
        observed(
            secs,
            Observation::InCase {
                bud: Bud::Local,
                in_case,
            },
        )
    }

    /// Primary with a connected phone; `link_up` decides whether a handover can run.
    fn primary(link_up: bool) -> TopologyState {
        let mut state = default_state();
        state.handle_indication(Indication::HandsetPaired { device: PHONE });
        state.handle_indication(if link_up {
            Indication::PeerLinkUp
        } else {
            Indication::PeerPaired
        });
        let effects = state.handle_command(TopologyCommand::Start);
        respond(&mut state, effects);
        let effects = state.handle_indication(Indication::RoleFound { role: Role::Primary });
        respond(&mut state, effects);
        assert!(state.handsets().is_connected(PHONE));
        state
    }

    #[test]
    fn bud_in_case_hands_over() {
        let mut state = primary(true);
        let effects = state.handle_indication(in_case(1, true));
        assert!(emitted(&effects).iter().any(|e| matches!(
            e,
            TopologyEvent::HandoverStarted {
                reason: HandoverReason::InCase,
                ..
            }
        )));
        assert!(state.handover_active());
    }

    #[test]
    fn observations_on_secondary_request_nothing() {
        let mut state = default_state();
        state.handle_indication(Indication::PeerLinkUp);
        state.handle_command(TopologyCommand::Start);
        state.handle_indication(Indication::RoleFound {
            role: Role::Secondary,
        });
        state.handle_indication(in_case(1, true));
        assert!(!state.events().contains(RuleEvents::HANDOVER_REQUESTED));
    }

    #[test]
    fn withdrawn_recommendation_clears_the_request() {
        let mut state = primary(false);
        state.handle_indication(in_case(1, true));
        assert!(state.events().contains(RuleEvents::HANDOVER_REQUESTED));

        state.handle_indication(in_case(2, false));
        assert!(!state.events().contains(RuleEvents::HANDOVER_REQUESTED));
        assert!(state.decider().current().is_none());
    }

    #[test]
    fn out_of_ear_is_rechecked_after_the_grace_period() {
        let mut state = primary(false);
        let effects = state.handle_indication(observed(
            0,
            Observation::InEar {
                bud: Bud::Local,
                in_ear: false,
            },
        ));
        let (token, after) = effects
            .iter()
            .find_map(|e| match e {
                TopologyEffect::StartTimer { token, after }
                    if token.owner() == TimerOwner::Decision =>
                {
                    Some((*token, *after))
                }
                _ => None,
            })
            .expect("no recheck armed");
        assert_eq!(after, Duration::from_secs(3));
        assert!(!state.events().contains(RuleEvents::HANDOVER_REQUESTED));

        state.handle_timer(token);
        assert!(state.events().contains(RuleEvents::HANDOVER_REQUESTED));
    }

    #[test]
    fn peer_link_loss_forgets_the_recommendation() {
        let mut state = primary(false);
        state.handle_command(TopologyCommand::RequestHandover {
            reason: HandoverReason::External,
        });
        state.handle_indication(in_case(1, true));
        assert!(state.events().contains(RuleEvents::HANDOVER_REQUESTED));

        state.handle_indication(Indication::PeerLinkDown);
        assert!(!state.events().contains(RuleEvents::HANDOVER_REQUESTED));
        assert!(state.decider().current().is_none());
    }
}
