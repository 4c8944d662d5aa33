//! Statistics for the earbud topology runtime.
//!
//! [`Counter`] is a relaxed atomic tally that serialises as a plain `u64`;
//! [`TopologyMetrics`] groups the counters one node keeps about its goals
//! and handover sessions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic event tally.
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn with_value(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self::with_value(self.get())
    }
}

impl PartialEq for Counter {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

impl Serialize for Counter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.get())
    }
}

impl<'de> Deserialize<'de> for Counter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self::with_value)
    }
}

// ── Topology statistics ───────────────────────────────────────────────

/// Counters kept by one topology node.
///
/// Cloning takes a point-in-time snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyMetrics {
    pub goals_started: Counter,
    pub goals_succeeded: Counter,
    pub goals_failed: Counter,
    pub goals_cancelled: Counter,
    pub handovers_started: Counter,
    pub handovers_committed: Counter,
    pub handovers_vetoed: Counter,
    pub handovers_aborted: Counter,
    /// Participant state bytes sent to the peer during marshalling.
    pub marshal_bytes: Counter,
}

impl TopologyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handovers that ended, whatever the outcome.
    pub fn handovers_finished(&self) -> u64 {
        self.handovers_committed.get() + self.handovers_vetoed.get() + self.handovers_aborted.get()
    }
}

impl fmt::Display for TopologyMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "goals {}/{} ok, {} failed, {} cancelled; handovers {}/{} committed, {} vetoed, {} aborted; {} B marshalled",
            self.goals_succeeded.get(),
            self.goals_started.get(),
            self.goals_failed.get(),
            self.goals_cancelled.get(),
            self.handovers_committed.get(),
            self.handovers_started.get(),
            self.handovers_vetoed.get(),
            self.handovers_aborted.get(),
            self.marshal_bytes.get(),
        )
    }
}
