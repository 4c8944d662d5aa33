/// Value types shared by every layer of the topology.
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Role ──────────────────────────────────────────────────────────────

/// Topology role held by a node.
///
/// At any settled time exactly one node of the pair is `Primary`; both may be
/// `None` while role discovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    None,
    Primary,
    Secondary,
}

impl Role {
    pub fn is_primary(self) -> bool {
        self == Role::Primary
    }

    pub fn is_secondary(self) -> bool {
        self == Role::Secondary
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::None => write!(f, "none"),
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

// ── Devices ───────────────────────────────────────────────────────────

/// Stable handle to a remote device (handset).
///
/// Indexes the node's device table. The handle outlives individual
/// transport connections, so a handset keeps its id across reconnects
/// and across a handover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u16);

impl DeviceId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceRecord {
    paired: bool,
    connected: bool,
    /// Logical clock of the most recent connection (for LRU selection).
    last_used: u64,
}

/// Arena of known handsets, indexed by [`DeviceId`].
#[derive(Debug, Default)]
pub struct DeviceTable {
    records: Vec<DeviceRecord>,
    clock: u64,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, device: DeviceId) -> &mut DeviceRecord {
        let idx = device.index();
        if idx >= self.records.len() {
            self.records.resize_with(idx + 1, DeviceRecord::default);
        }
        &mut self.records[idx]
    }

    pub fn pair(&mut self, device: DeviceId) {
        self.slot(device).paired = true;
    }

    /// Mark connected. Returns `false` if it already was.
    pub fn connect(&mut self, device: DeviceId) -> bool {
        self.clock += 1;
        let clock = self.clock;
        let record = self.slot(device);
        record.paired = true;
        record.last_used = clock;
        !std::mem::replace(&mut record.connected, true)
    }

    /// Mark disconnected. Returns `false` if it was not connected.
    pub fn disconnect(&mut self, device: DeviceId) -> bool {
        std::mem::replace(&mut self.slot(device).connected, false)
    }

    pub fn is_connected(&self, device: DeviceId) -> bool {
        self.records
            .get(device.index())
            .is_some_and(|r| r.connected)
    }

    pub fn any_paired(&self) -> bool {
        self.records.iter().any(|r| r.paired)
    }

    pub fn paired_count(&self) -> usize {
        self.records.iter().filter(|r| r.paired).count()
    }

    pub fn connected(&self) -> Vec<DeviceId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.connected)
            .map(|(i, _)| DeviceId(i as u16))
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.records.iter().filter(|r| r.connected).count()
    }

    /// The connected handset used least recently.
    pub fn least_recently_used(&self) -> Option<DeviceId> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.connected)
            .min_by_key(|(_, r)| r.last_used)
            .map(|(i, _)| DeviceId(i as u16))
    }
}

// ── Profiles ──────────────────────────────────────────────────────────

/// Set of handset profiles to (re)connect.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Profiles(u8);

impl Profiles {
    pub const NONE: Profiles = Profiles(0);
    pub const HFP: Profiles = Profiles(1 << 0);
    pub const A2DP: Profiles = Profiles(1 << 1);
    pub const AVRCP: Profiles = Profiles(1 << 2);

    pub const fn union(self, other: Profiles) -> Profiles {
        Profiles(self.0 | other.0)
    }

    pub const fn contains(self, other: Profiles) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Profiles {
    type Output = Profiles;

    fn bitor(self, rhs: Profiles) -> Profiles {
        self.union(rhs)
    }
}

impl fmt::Debug for Profiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (Profiles::HFP, "HFP"),
            (Profiles::A2DP, "A2DP"),
            (Profiles::AVRCP, "AVRCP"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

// ── Handover reason / results ─────────────────────────────────────────

/// Why a dynamic handover was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandoverReason {
    InCase,
    OutOfEar,
    BatteryLevel,
    VoiceQuality,
    Rssi,
    LinkQuality,
    External,
}

/// Terminal result reported by a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureResult {
    Success,
    Failed,
    Timeout,
}

impl ProcedureResult {
    pub fn is_success(self) -> bool {
        self == ProcedureResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_table_tracks_lru() {
        let mut table = DeviceTable::new();
        let a = DeviceId::new(0);
        let b = DeviceId::new(3);
        assert!(table.connect(a));
        assert!(table.connect(b));
        assert!(!table.connect(b), "second connect is not a change");
        assert_eq!(table.connected(), vec![a, b]);
        assert_eq!(table.least_recently_used(), Some(a));

        table.disconnect(a);
        table.connect(a);
        assert_eq!(table.least_recently_used(), Some(b));
    }

    #[test]
    fn device_table_pairing_survives_disconnect() {
        let mut table = DeviceTable::new();
        let a = DeviceId::new(1);
        table.pair(a);
        assert!(!table.is_connected(a));
        table.connect(a);
        assert!(table.disconnect(a));
        assert!(!table.disconnect(a));
        assert!(table.any_paired());
        assert_eq!(table.paired_count(), 1);
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn profiles_debug_lists_members() {
        let p = Profiles::HFP | Profiles::A2DP;
        assert_eq!(format!("{p:?}"), "HFP|A2DP");
        assert!(p.contains(Profiles::A2DP));
        assert!(!p.contains(Profiles::AVRCP));
        assert_eq!(format!("{:?}", Profiles::NONE), "NONE");
    }

    #[test]
    fn role_msgpack_roundtrip() {
        let bytes = rmp_serde::to_vec(&Role::Secondary).unwrap();
        let back: Role = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, Role::Secondary);
    }
}
