/// The earbud rule table and its conditions.
///
/// Conditions are pure functions of a [`TopologyView`] snapshot taken just
/// before the evaluation pass; they only log.
use tracing::trace;

use crate::events::RuleEvents;
use crate::goals::{GoalId, GoalParams, GoalSnapshot};
use crate::types::{HandoverReason, Profiles, Role};

use super::{Rule, RuleAction};

/// Read-only view of the node that rule conditions decide on.
#[derive(Debug, Clone, Default)]
pub struct TopologyView {
    pub role: Role,
    pub stopping: bool,
    pub peer_paired: bool,
    pub peer_link_up: bool,
    pub peer_profiles_connected: bool,
    pub handsets_paired: usize,
    pub handsets_connected: usize,
    pub max_handsets: usize,
    pub prohibit_connect: bool,
    pub audio_streaming: bool,
    pub dynamic_handover: bool,
    pub auto_connect_profiles: Profiles,
    pub handover_reason: Option<HandoverReason>,
    pub goals: GoalSnapshot,
}

impl TopologyView {
    /// A paired peer exists but no role has been settled yet.
    fn awaiting_role(&self) -> bool {
        self.role == Role::None && self.peer_paired
    }

    /// Whether this node may own handset connections right now.
    fn handset_owner(&self) -> bool {
        !self.stopping && !self.role.is_secondary() && !self.awaiting_role()
    }
}

// ── Conditions ────────────────────────────────────────────────────────

fn rule_stop(v: &TopologyView) -> RuleAction {
    if v.goals.is_pending(GoalId::SystemStop) {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_find_role(v: &TopologyView) -> RuleAction {
    if v.stopping || !v.awaiting_role() {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_no_role_idle(v: &TopologyView) -> RuleAction {
    if v.stopping || v.role != Role::None {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_connect_peer_profiles(v: &TopologyView) -> RuleAction {
    if v.stopping || !v.role.is_primary() || !v.peer_link_up || v.peer_profiles_connected {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_disconnect_peer_profiles(v: &TopologyView) -> RuleAction {
    if !v.peer_profiles_connected || v.peer_link_up {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

/// Connectability switches follow the role: on for a handset owner, off otherwise.
fn connectability(v: &TopologyView, honour_prohibit: bool) -> RuleAction {
    if v.stopping {
        return RuleAction::Ignore;
    }
    if v.awaiting_role() {
        return if v.goals.is_pending(GoalId::FindRole) {
            RuleAction::Defer
        } else {
            RuleAction::Ignore
        };
    }
    let enable = v.handset_owner() && !(honour_prohibit && v.prohibit_connect);
    RuleAction::RunWithParam(GoalParams::Enable(enable))
}

fn rule_allow_le_connection(v: &TopologyView) -> RuleAction {
    connectability(v, false)
}

fn rule_connectable_handset(v: &TopologyView) -> RuleAction {
    connectability(v, true)
}

fn rule_allow_handset_connect(v: &TopologyView) -> RuleAction {
    connectability(v, true)
}

/// Shared gate for every rule that (re)connects a handset.
fn handset_connect_gate(v: &TopologyView) -> Option<RuleAction> {
    if v.awaiting_role() && v.goals.is_pending(GoalId::FindRole) {
        return Some(RuleAction::Defer);
    }
    if !v.handset_owner() {
        trace!(role = %v.role, stopping = v.stopping, "not a handset owner");
        return Some(RuleAction::Ignore);
    }
    if v.prohibit_connect {
        return Some(RuleAction::Ignore);
    }
    if v.goals.is_pending(GoalId::DisconnectHandset)
        || v.goals.is_pending(GoalId::DisconnectLruHandset)
    {
        return Some(RuleAction::Defer);
    }
    if v.handsets_paired == 0 {
        trace!("no paired handset");
        return Some(RuleAction::Ignore);
    }
    if v.handsets_connected >= v.handsets_paired || v.handsets_connected >= v.max_handsets {
        trace!(connected = v.handsets_connected, "handsets already connected");
        return Some(RuleAction::Ignore);
    }
    if v.goals.is_pending(GoalId::DynamicHandover) {
        return Some(RuleAction::Ignore);
    }
    None
}

fn connect_with_profiles(v: &TopologyView) -> RuleAction {
    RuleAction::RunWithParam(GoalParams::Profiles(v.auto_connect_profiles))
}

fn rule_auto_connect_handset(v: &TopologyView) -> RuleAction {
    handset_connect_gate(v).unwrap_or_else(|| connect_with_profiles(v))
}

fn rule_linkloss_reconnect_handset(v: &TopologyView) -> RuleAction {
    if let Some(action) = handset_connect_gate(v) {
        return action;
    }
    // Reconnecting would disturb audio streaming from the other handset.
    if v.audio_streaming && v.handsets_connected > 0 {
        trace!("ignoring link loss while streaming from another handset");
        return RuleAction::Ignore;
    }
    connect_with_profiles(v)
}

fn rule_user_connect_handset(v: &TopologyView) -> RuleAction {
    handset_connect_gate(v).unwrap_or_else(|| connect_with_profiles(v))
}

fn rule_prohibit_connect_disconnect(v: &TopologyView) -> RuleAction {
    if v.stopping || v.role.is_secondary() || !v.prohibit_connect {
        return RuleAction::Ignore;
    }
    if v.handsets_connected == 0 && !v.goals.is_pending(GoalId::ConnectHandset) {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_user_disconnect_all(v: &TopologyView) -> RuleAction {
    if v.stopping || v.role.is_secondary() {
        return RuleAction::Ignore;
    }
    if v.handsets_connected == 0 && !v.goals.is_pending(GoalId::ConnectHandset) {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_user_disconnect_lru(v: &TopologyView) -> RuleAction {
    if v.stopping || v.role.is_secondary() {
        return RuleAction::Ignore;
    }
    if v.goals.is_pending(GoalId::ConnectHandset) || v.goals.is_pending(GoalId::DisconnectHandset) {
        return RuleAction::Defer;
    }
    if v.handsets_connected == 0 {
        return RuleAction::Ignore;
    }
    RuleAction::Run
}

fn rule_dynamic_handover(v: &TopologyView) -> RuleAction {
    let Some(reason) = v.handover_reason else {
        return RuleAction::Ignore;
    };
    if !v.dynamic_handover
        || v.stopping
        || !v.role.is_primary()
        || !v.peer_link_up
        || v.handsets_connected == 0
    {
        trace!(role = %v.role, peer = v.peer_link_up, "handover not applicable");
        return RuleAction::Ignore;
    }
    if v.goals.is_pending(GoalId::DisconnectHandset)
        || v.goals.is_pending(GoalId::DisconnectLruHandset)
    {
        return RuleAction::Defer;
    }
    RuleAction::RunWithParam(GoalParams::Handover(reason))
}

// ── Table ─────────────────────────────────────────────────────────────

const ROLE_SETTLED: RuleEvents =
    RuleEvents::from_bits(RuleEvents::START.bits() | RuleEvents::ROLE_SWITCH.bits());

/// Handset connectability also follows the prohibit switch.
const CONNECTABILITY: RuleEvents =
    RuleEvents::from_bits(ROLE_SETTLED.bits() | RuleEvents::PROHIBIT_CONNECT_TO_HANDSET.bits());

/// Earbud rules, in evaluation order.
pub static RULES: [Rule<TopologyView>; 16] = [
    Rule {
        name: "stop",
        trigger: RuleEvents::STOP,
        condition: rule_stop,
        goal: GoalId::SystemStop,
    },
    Rule {
        name: "find_role",
        trigger: RuleEvents::START,
        condition: rule_find_role,
        goal: GoalId::FindRole,
    },
    Rule {
        name: "no_role_idle",
        trigger: RuleEvents::NO_ROLE,
        condition: rule_no_role_idle,
        goal: GoalId::NoRoleIdle,
    },
    Rule {
        name: "connect_peer_profiles",
        trigger: RuleEvents::from_bits(
            RuleEvents::ROLE_SWITCH.bits() | RuleEvents::PEER_CONNECTED.bits(),
        ),
        condition: rule_connect_peer_profiles,
        goal: GoalId::ConnectPeerProfiles,
    },
    Rule {
        name: "disconnect_peer_profiles",
        trigger: RuleEvents::PEER_DISCONNECTED,
        condition: rule_disconnect_peer_profiles,
        goal: GoalId::DisconnectPeerProfiles,
    },
    Rule {
        name: "allow_le_connection",
        trigger: ROLE_SETTLED,
        condition: rule_allow_le_connection,
        goal: GoalId::AllowLeConnection,
    },
    Rule {
        name: "connectable_handset",
        trigger: CONNECTABILITY,
        condition: rule_connectable_handset,
        goal: GoalId::ConnectableHandset,
    },
    Rule {
        name: "allow_handset_connect",
        trigger: CONNECTABILITY,
        condition: rule_allow_handset_connect,
        goal: GoalId::AllowHandsetConnect,
    },
    Rule {
        name: "auto_connect_handset",
        trigger: ROLE_SETTLED,
        condition: rule_auto_connect_handset,
        goal: GoalId::ConnectHandset,
    },
    Rule {
        name: "linkloss_reconnect_handset",
        trigger: RuleEvents::HANDSET_LINKLOSS,
        condition: rule_linkloss_reconnect_handset,
        goal: GoalId::ConnectHandset,
    },
    Rule {
        name: "user_connect_handset",
        trigger: RuleEvents::USER_REQUEST_CONNECT_HANDSET,
        condition: rule_user_connect_handset,
        goal: GoalId::ConnectHandset,
    },
    Rule {
        name: "prohibit_connect_disconnect",
        trigger: RuleEvents::PROHIBIT_CONNECT_TO_HANDSET,
        condition: rule_prohibit_connect_disconnect,
        goal: GoalId::DisconnectHandset,
    },
    Rule {
        name: "user_disconnect_all_handsets",
        trigger: RuleEvents::USER_REQUEST_DISCONNECT_ALL_HANDSETS,
        condition: rule_user_disconnect_all,
        goal: GoalId::DisconnectHandset,
    },
    Rule {
        name: "user_disconnect_lru_handset",
        trigger: RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET,
        condition: rule_user_disconnect_lru,
        goal: GoalId::DisconnectLruHandset,
    },
    Rule {
        name: "dynamic_handover",
        trigger: RuleEvents::HANDOVER_REQUESTED,
        condition: rule_dynamic_handover,
        goal: GoalId::DynamicHandover,
    },
    Rule {
        name: "reconnect_after_failed_handover",
        trigger: RuleEvents::HANDOVER_FAILED,
        condition: rule_user_connect_handset,
        goal: GoalId::ConnectHandset,
    },
];
