/// Timer bookkeeping for the topology state.
///
/// Timers are armed as detached sleeps that report a [`TimerToken`] back to
/// the loop. Re-arming or disarming bumps the owner's generation, so a
/// token that fires after that point no longer matches and is dropped.
use std::collections::HashMap;

use crate::goals::{GoalId, RunId};
use crate::procedures::TimerKind;

/// Who a timer belongs to. One live timer per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerOwner {
    Goal {
        goal: GoalId,
        run: RunId,
        kind: TimerKind,
    },
    Handover {
        session: u8,
    },
    /// Deferred re-evaluation of the handover decider.
    Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken {
    owner: TimerOwner,
    generation: u64,
}

impl TimerToken {
    pub fn owner(&self) -> TimerOwner {
        self.owner
    }
}

#[derive(Debug, Default)]
pub struct TimerTable {
    armed: HashMap<TimerOwner, u64>,
    generation: u64,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer of `owner`.
    pub fn arm(&mut self, owner: TimerOwner) -> TimerToken {
        self.generation += 1;
        self.armed.insert(owner, self.generation);
        TimerToken {
            owner,
            generation: self.generation,
        }
    }

    pub fn disarm(&mut self, owner: TimerOwner) -> bool {
        self.armed.remove(&owner).is_some()
    }

    /// Disarm every timer of one procedure run.
    pub fn disarm_run(&mut self, run: RunId) {
        self.armed
            .retain(|owner, _| !matches!(owner, TimerOwner::Goal { run: r, .. } if *r == run));
    }

    /// Consume a fired token. `None` when it was disarmed or superseded.
    pub fn fire(&mut self, token: TimerToken) -> Option<TimerOwner> {
        match self.armed.get(&token.owner) {
            Some(generation) if *generation == token.generation => {
                self.armed.remove(&token.owner);
                Some(token.owner)
            }
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
