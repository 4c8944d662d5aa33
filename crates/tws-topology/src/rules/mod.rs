/// Rule engine: turns the Event Set into goal requests.
///
/// Rules are walked in definition order on every evaluation pass. A rule is
/// only looked at when its trigger intersects the Event Set; its condition
/// decides whether to ignore, defer, or run its goal. A rule that ran stays
/// *in flight* (and its trigger bits stay set) until its goal finishes.
///
/// Each rule remembers which set bits it already ran for. It reacts to a bit
/// once per occurrence: raising the bit again starts a new occurrence, and
/// clearing it forgets the old one. Ignore and Defer leave the Event Set
/// untouched; only a finished goal or an explicit reset clears bits.
pub mod table;

pub use table::{TopologyView, RULES};

use tracing::{debug, trace};

use crate::events::RuleEvents;
use crate::goals::{GoalId, GoalParams};

/// What a rule condition decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Ignore,
    /// Keep the event and look again on the next pass.
    Defer,
    Run,
    RunWithParam(GoalParams),
}

/// Static rule: when `trigger` is pending, ask `condition` whether to run `goal`.
pub struct Rule<C> {
    pub name: &'static str,
    pub trigger: RuleEvents,
    pub condition: fn(&C) -> RuleAction,
    pub goal: GoalId,
}

/// Goal request produced by an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoalRequest {
    pub goal: GoalId,
    pub params: GoalParams,
    /// Index of the rule that produced it.
    pub rule: usize,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    rule: usize,
    goal: GoalId,
    trigger: RuleEvents,
}

pub struct RuleEngine<C: 'static> {
    rules: &'static [Rule<C>],
    events: RuleEvents,
    /// Per rule, the pending bits it already ran for.
    served: Vec<RuleEvents>,
    in_flight: Vec<InFlight>,
}

impl<C: 'static> RuleEngine<C> {
    pub fn new(rules: &'static [Rule<C>]) -> Self {
        Self {
            rules,
            events: RuleEvents::NONE,
            served: vec![RuleEvents::NONE; rules.len()],
            in_flight: Vec::new(),
        }
    }

    pub fn events(&self) -> RuleEvents {
        self.events
    }

    /// Raise events. Every rule may react to a raised bit again, even one
    /// that was already set. Returns whether the Event Set changed.
    pub fn set_event(&mut self, events: RuleEvents) -> bool {
        if events.is_empty() {
            return false;
        }
        self.forget(events);
        let changed = self.events.insert(events);
        debug!(?events, set = ?self.events, changed, "events set");
        changed
    }

    /// Clear events without running anything. Returns whether the Event
    /// Set changed.
    pub fn reset_event(&mut self, events: RuleEvents) -> bool {
        self.forget(events);
        let changed = self.events.remove(events);
        if changed {
            debug!(?events, set = ?self.events, "events reset");
        }
        changed
    }

    /// Whether some rule is waiting on `goal`.
    pub fn is_in_flight(&self, goal: GoalId) -> bool {
        self.in_flight.iter().any(|f| f.goal == goal)
    }

    /// Walk the table once against `ctx`.
    pub fn evaluate(&mut self, ctx: &C) -> Vec<GoalRequest> {
        let mut requests = Vec::new();

        let rules = self.rules;
        for (idx, rule) in rules.iter().enumerate() {
            let hit = (rule.trigger & self.events).difference(self.served[idx]);
            if hit.is_empty() {
                continue;
            }
            // Re-raised while running: looked at again once the goal finishes.
            if self.in_flight.iter().any(|f| f.rule == idx) {
                continue;
            }
            let action = (rule.condition)(ctx);
            trace!(rule = rule.name, ?hit, ?action, "rule evaluated");
            let params = match action {
                RuleAction::Ignore | RuleAction::Defer => continue,
                RuleAction::Run => GoalParams::None,
                RuleAction::RunWithParam(params) => params,
            };

            self.served[idx] |= hit;
            let joined = self.is_in_flight(rule.goal);
            self.in_flight.push(InFlight {
                rule: idx,
                goal: rule.goal,
                trigger: hit,
            });
            if joined {
                debug!(rule = rule.name, goal = ?rule.goal, "rule joined goal already requested");
            } else {
                debug!(rule = rule.name, goal = ?rule.goal, ?params, "rule fired");
                requests.push(GoalRequest {
                    goal: rule.goal,
                    params,
                    rule: idx,
                });
            }
        }
        requests
    }

    /// The goal behind in-flight rules finished, whatever the result.
    /// Their trigger bits are cleared unless another in-flight rule still
    /// holds them; a finished rule does not run again for a bit that stays
    /// held. A failed goal is re-selected only when a trigger is raised again.
    pub fn goal_finished(&mut self, goal: GoalId) {
        let (done, rest): (Vec<InFlight>, Vec<InFlight>) =
            self.in_flight.drain(..).partition(|f| f.goal == goal);
        self.in_flight = rest;
        let still_held = self
            .in_flight
            .iter()
            .fold(RuleEvents::NONE, |acc, f| acc | f.trigger);
        let consumed = done
            .iter()
            .fold(RuleEvents::NONE, |acc, f| acc | f.trigger)
            .difference(still_held);
        if !consumed.is_empty() {
            trace!(?goal, ?consumed, "goal consumed events");
            self.events.remove(consumed);
            self.forget(consumed);
        }
    }

    /// Forget rules waiting on a goal that will never run. Their pending
    /// bits become eligible again.
    pub fn abandon(&mut self, goal: GoalId) {
        let served = &mut self.served;
        self.in_flight.retain(|f| {
            if f.goal != goal {
                return true;
            }
            served[f.rule].remove(f.trigger);
            false
        });
    }

    /// Drop every record of rules having run for `events`.
    fn forget(&mut self, events: RuleEvents) {
        for served in &mut self.served {
            served.remove(events);
        }
        for f in &mut self.in_flight {
            f.trigger.remove(events);
        }
    }
}
