//! TWS earbud topology.
//!
//! Decides which of the two earbuds is primary, keeps the handset
//! connections that role owns in the right state, and hands the primary
//! role over to the peer live, without dropping the handset.
//!
//! Events land in an Event Set, a rule table turns them into goals, and
//! the goal executor runs one procedure per goal while keeping conflicting
//! goals apart. The handover coordinator walks every registered
//! participant through veto, marshal, unmarshal and commit.
//!
//! Wire format: MessagePack (compact binary).

pub mod config;
pub mod decision;
pub mod error;
pub mod events;
pub mod goals;
pub mod handover;
pub mod procedures;
pub mod protocol;
pub mod rules;
pub mod runtime;
pub mod services;
pub mod types;

pub use config::TopologyConfig;
pub use decision::{
    BatteryState, Bud, Decision, DecisionConfig, HandoverDecider, Observation, QualityLevel,
    QualityLevels, Recommendation, Urgency,
};
pub use error::{HandoverError, TopologyError};
pub use events::RuleEvents;
pub use goals::{GoalEvent, GoalExecutor, GoalId, GoalParams, GoalSnapshot, GoalState};
pub use handover::{
    Direction, HandoverAction, HandoverCoordinator, HandoverMessage, HandoverOutcome,
    HandoverParticipant, MarshalError, MarshalProgress, ParticipantRegistry, Phase,
    ProfileParticipant, ProfileState,
};
pub use protocol::PeerMessage;
pub use rules::{RuleAction, RuleEngine, TopologyView};
pub use runtime::{
    DeliveryTag, LinkControl, MemoryPeerChannel, PeerChannel, ServiceBus, TopologyChannels,
    TopologyCommand, TopologyEffect, TopologyEvent, TopologyHandle, TopologyRuntime,
    TopologyState,
};
pub use services::{Indication, ServiceRequest, Setting};
pub use types::{DeviceId, DeviceTable, HandoverReason, ProcedureResult, Profiles, Role};
pub use tws_metrics::TopologyMetrics;
