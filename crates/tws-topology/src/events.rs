/// The Event Set: pending topology events the rule table reacts to.
///
/// Each event is one bit. Setting a bit that is already set changes
/// nothing, which is what keeps repeated indications harmless.
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RuleEvents(u32);

impl RuleEvents {
    pub const NONE: RuleEvents = RuleEvents(0);
    pub const START: RuleEvents = RuleEvents(1 << 0);
    pub const STOP: RuleEvents = RuleEvents(1 << 1);
    pub const PEER_CONNECTED: RuleEvents = RuleEvents(1 << 2);
    pub const PEER_DISCONNECTED: RuleEvents = RuleEvents(1 << 3);
    pub const ROLE_SWITCH: RuleEvents = RuleEvents(1 << 4);
    pub const NO_ROLE: RuleEvents = RuleEvents(1 << 5);
    pub const HANDSET_LINKLOSS: RuleEvents = RuleEvents(1 << 6);
    pub const USER_REQUEST_CONNECT_HANDSET: RuleEvents = RuleEvents(1 << 7);
    pub const USER_REQUEST_DISCONNECT_ALL_HANDSETS: RuleEvents = RuleEvents(1 << 8);
    pub const USER_REQUEST_DISCONNECT_LRU_HANDSET: RuleEvents = RuleEvents(1 << 9);
    pub const PROHIBIT_CONNECT_TO_HANDSET: RuleEvents = RuleEvents(1 << 10);
    pub const HANDOVER_REQUESTED: RuleEvents = RuleEvents(1 << 11);
    pub const HANDOVER_FAILED: RuleEvents = RuleEvents(1 << 12);
    pub const FAILED_PEER_CONNECT: RuleEvents = RuleEvents(1 << 13);

    const NAMES: [(RuleEvents, &'static str); 14] = [
        (Self::START, "START"),
        (Self::STOP, "STOP"),
        (Self::PEER_CONNECTED, "PEER_CONNECTED"),
        (Self::PEER_DISCONNECTED, "PEER_DISCONNECTED"),
        (Self::ROLE_SWITCH, "ROLE_SWITCH"),
        (Self::NO_ROLE, "NO_ROLE"),
        (Self::HANDSET_LINKLOSS, "HANDSET_LINKLOSS"),
        (Self::USER_REQUEST_CONNECT_HANDSET, "USER_REQUEST_CONNECT_HANDSET"),
        (Self::USER_REQUEST_DISCONNECT_ALL_HANDSETS, "USER_REQUEST_DISCONNECT_ALL_HANDSETS"),
        (Self::USER_REQUEST_DISCONNECT_LRU_HANDSET, "USER_REQUEST_DISCONNECT_LRU_HANDSET"),
        (Self::PROHIBIT_CONNECT_TO_HANDSET, "PROHIBIT_CONNECT_TO_HANDSET"),
        (Self::HANDOVER_REQUESTED, "HANDOVER_REQUESTED"),
        (Self::HANDOVER_FAILED, "HANDOVER_FAILED"),
        (Self::FAILED_PEER_CONNECT, "FAILED_PEER_CONNECT"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: RuleEvents) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: RuleEvents) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn difference(self, other: RuleEvents) -> RuleEvents {
        RuleEvents(self.0 & !other.0)
    }

    /// Set `other`; returns whether any bit changed.
    pub fn insert(&mut self, other: RuleEvents) -> bool {
        let before = self.0;
        self.0 |= other.0;
        self.0 != before
    }

    /// Clear `other`; returns whether any bit changed.
    pub fn remove(&mut self, other: RuleEvents) -> bool {
        let before = self.0;
        self.0 &= !other.0;
        self.0 != before
    }
}

impl BitOr for RuleEvents {
    type Output = RuleEvents;

    fn bitor(self, rhs: RuleEvents) -> RuleEvents {
        RuleEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for RuleEvents {
    fn bitor_assign(&mut self, rhs: RuleEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for RuleEvents {
    type Output = RuleEvents;

    fn bitand(self, rhs: RuleEvents) -> RuleEvents {
        RuleEvents(self.0 & rhs.0)
    }
}

impl fmt::Debug for RuleEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        let mut known = RuleEvents::NONE;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
                known |= flag;
            }
        }
        let unknown = self.difference(known);
        if !unknown.is_empty() {
            if !first {
                write!(f, " | ")?;
            }
            write!(f, "{:#x}", unknown.0)?;
        }
        Ok(())
    }
}
