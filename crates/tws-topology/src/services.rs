/// Interface to the external services the topology drives.
///
/// Procedures never call a profile stack or connection manager directly:
/// they emit a [`ServiceRequest`] and wait for the matching [`Indication`]
/// to be delivered back into the runtime loop.
use serde::{Deserialize, Serialize};

use std::time::Duration;

use crate::decision::Observation;
use crate::types::{DeviceId, Profiles, Role};

/// Connectability switches toggled by the settings procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Setting {
    /// Page/inquiry scan for handsets.
    HandsetConnectable,
    /// Whether handsets may create an ACL to this node.
    HandsetConnectAllowed,
    /// LE advertising/connections.
    LeConnectionAllowed,
}

/// Request from the topology to an external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceRequest {
    FindRole,
    CancelFindRole,
    /// Peer signalling, handover and mirroring profiles.
    ConnectPeerProfiles,
    DisconnectPeerProfiles,
    Configure { setting: Setting, enable: bool },
    ReconnectHandset { profiles: Profiles },
    StopReconnect,
    DisconnectHandsets,
    DisconnectLruHandset,
    /// Hold the handset link open until released.
    RetainLink { device: DeviceId },
    ReleaseLink { device: DeviceId },
}

/// Confirmations and unsolicited indications from the external services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Indication {
    RoleFound { role: Role },
    PeerPaired,
    PeerLinkUp,
    PeerLinkDown,
    PeerProfilesConnected { ok: bool },
    PeerProfilesDisconnected,
    Configured { setting: Setting },
    HandsetPaired { device: DeviceId },
    HandsetConnected { device: DeviceId },
    HandsetDisconnected { device: DeviceId, link_loss: bool },
    ReconnectCfm { ok: bool },
    ReconnectStopped,
    DisconnectCfm { lru: bool, ok: bool },
    /// A2DP audio started on a connected handset.
    AudioStarted,
    AudioStopped,
    /// Sensor or link report for the handover decider. `at` is a monotonic
    /// timestamp; only differences between reports matter.
    Observed { at: Duration, observation: Observation },
}
