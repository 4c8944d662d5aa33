/// Goals: named units of topology work selected by the rule table.
///
/// The static [`GOALS`] table declares, per goal, which goals it cancels
/// (conflict set), which it may run alongside, and which events it raises
/// back into the Event Set when it finishes.
mod executor;

pub use executor::{GoalEvent, GoalExecutor, GoalOutput, ProcedureFactory, RequestOutcome, RunId};

use serde::{Deserialize, Serialize};

use crate::events::RuleEvents;
use crate::types::{HandoverReason, Profiles};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GoalId {
    SystemStop,
    FindRole,
    NoRoleIdle,
    ConnectPeerProfiles,
    DisconnectPeerProfiles,
    AllowLeConnection,
    ConnectableHandset,
    AllowHandsetConnect,
    ConnectHandset,
    DisconnectHandset,
    DisconnectLruHandset,
    DynamicHandover,
}

impl GoalId {
    pub const ALL: [GoalId; 12] = [
        GoalId::SystemStop,
        GoalId::FindRole,
        GoalId::NoRoleIdle,
        GoalId::ConnectPeerProfiles,
        GoalId::DisconnectPeerProfiles,
        GoalId::AllowLeConnection,
        GoalId::ConnectableHandset,
        GoalId::AllowHandsetConnect,
        GoalId::ConnectHandset,
        GoalId::DisconnectHandset,
        GoalId::DisconnectLruHandset,
        GoalId::DynamicHandover,
    ];

    pub fn entry(self) -> &'static GoalEntry {
        &GOALS[self as usize]
    }

    /// Whether `self` and `other` may never be active together.
    pub fn conflicts_with(self, other: GoalId) -> bool {
        self.entry().conflicts.contains(&other) || other.entry().conflicts.contains(&self)
    }

    /// Whether `self` may be dispatched while `other` is active.
    pub fn runs_alongside(self, other: GoalId) -> bool {
        if self == other || self.conflicts_with(other) {
            return false;
        }
        self.entry().concurrent.contains(&other) || other.entry().concurrent.contains(&self)
    }
}

/// Typed parameter attached to a goal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GoalParams {
    #[default]
    None,
    Enable(bool),
    Profiles(Profiles),
    Handover(HandoverReason),
}

/// Static description of a goal.
#[derive(Debug)]
pub struct GoalEntry {
    pub id: GoalId,
    /// Goals cancelled (if active) or replaced (if queued) when this one is requested.
    pub conflicts: &'static [GoalId],
    /// Goals this one may be active alongside. Anything else must drain first.
    pub concurrent: &'static [GoalId],
    /// Raised into the Event Set when the goal succeeds.
    pub success_event: RuleEvents,
    /// Raised into the Event Set when the goal fails or times out.
    pub failure_event: RuleEvents,
}

const HANDSET_GOALS: &[GoalId] = &[
    GoalId::AllowLeConnection,
    GoalId::ConnectableHandset,
    GoalId::AllowHandsetConnect,
    GoalId::ConnectHandset,
    GoalId::ConnectPeerProfiles,
    GoalId::DisconnectPeerProfiles,
];

const SETTINGS_GOALS: &[GoalId] = &[
    GoalId::AllowLeConnection,
    GoalId::ConnectableHandset,
    GoalId::AllowHandsetConnect,
];

const fn goal(
    id: GoalId,
    conflicts: &'static [GoalId],
    concurrent: &'static [GoalId],
    success_event: RuleEvents,
    failure_event: RuleEvents,
) -> GoalEntry {
    GoalEntry {
        id,
        conflicts,
        concurrent,
        success_event,
        failure_event,
    }
}

/// Goal table, indexed by `GoalId as usize`.
pub static GOALS: [GoalEntry; 12] = [
    goal(
        GoalId::SystemStop,
        &[
            GoalId::FindRole,
            GoalId::NoRoleIdle,
            GoalId::ConnectPeerProfiles,
            GoalId::DisconnectPeerProfiles,
            GoalId::AllowLeConnection,
            GoalId::ConnectableHandset,
            GoalId::AllowHandsetConnect,
            GoalId::ConnectHandset,
            GoalId::DisconnectHandset,
            GoalId::DisconnectLruHandset,
            GoalId::DynamicHandover,
        ],
        &[],
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::FindRole,
        &[],
        &[],
        RuleEvents::ROLE_SWITCH,
        RuleEvents::NO_ROLE,
    ),
    goal(
        GoalId::NoRoleIdle,
        &[GoalId::ConnectHandset],
        &[],
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::ConnectPeerProfiles,
        &[GoalId::DisconnectPeerProfiles],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::FAILED_PEER_CONNECT,
    ),
    goal(
        GoalId::DisconnectPeerProfiles,
        &[GoalId::ConnectPeerProfiles],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::AllowLeConnection,
        &[],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::ConnectableHandset,
        &[],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::AllowHandsetConnect,
        &[],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::ConnectHandset,
        &[GoalId::DisconnectHandset],
        HANDSET_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::DisconnectHandset,
        &[GoalId::ConnectHandset],
        SETTINGS_GOALS,
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::DisconnectLruHandset,
        &[GoalId::ConnectHandset],
        &[],
        RuleEvents::NONE,
        RuleEvents::NONE,
    ),
    goal(
        GoalId::DynamicHandover,
        &[GoalId::ConnectHandset],
        &[],
        RuleEvents::ROLE_SWITCH,
        RuleEvents::HANDOVER_FAILED,
    ),
];

// ── Snapshots ─────────────────────────────────────────────────────────

/// Lifecycle state of a goal known to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoalState {
    Queued,
    Active,
    Cancelling,
}

/// Point-in-time view of the executor's goals, in dispatch order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSnapshot {
    pub goals: Vec<(GoalId, GoalState)>,
}

impl GoalSnapshot {
    pub fn state_of(&self, goal: GoalId) -> Option<GoalState> {
        // An id can be Cancelling and Queued at once; report the running one.
        self.goals
            .iter()
            .find(|(g, s)| *g == goal && *s != GoalState::Queued)
            .or_else(|| self.goals.iter().find(|(g, _)| *g == goal))
            .map(|(_, s)| *s)
    }

    pub fn is_active(&self, goal: GoalId) -> bool {
        self.goals
            .iter()
            .any(|(g, s)| *g == goal && *s == GoalState::Active)
    }

    pub fn is_queued(&self, goal: GoalId) -> bool {
        self.goals
            .iter()
            .any(|(g, s)| *g == goal && *s == GoalState::Queued)
    }

    /// Active, cancelling or queued.
    pub fn is_pending(&self, goal: GoalId) -> bool {
        self.goals.iter().any(|(g, _)| *g == goal)
    }

    pub fn active_count(&self) -> usize {
        self.goals
            .iter()
            .filter(|(_, s)| *s != GoalState::Queued)
            .count()
    }
}
