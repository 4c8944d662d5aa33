/// Goal executor: queues goal requests, enforces the conflict table, and
/// runs one procedure per active goal.
///
/// Pure state machine: every entry point returns the [`GoalOutput`]s it
/// produced (procedure effects plus lifecycle events). No I/O.
use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use crate::procedures::{Completion, Procedure, ProcedureEffect, ProcedureInput, ProcedureOutput};
use crate::types::ProcedureResult;

use super::{GoalId, GoalParams, GoalSnapshot, GoalState};

/// Builds the procedure for a goal.
pub type ProcedureFactory = Box<dyn Fn(GoalId) -> Box<dyn Procedure> + Send>;

/// Identifies one run of a goal's procedure. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(u32);

impl RunId {
    pub const fn new(n: u32) -> Self {
        Self(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Accepted,
    /// Same goal already active or queued.
    Ignored,
}

/// Goal lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalEvent {
    Started { goal: GoalId, run: RunId, ok: bool },
    Completed { goal: GoalId, run: RunId, result: ProcedureResult },
    Cancelled { goal: GoalId, run: RunId, result: ProcedureResult },
    /// A queued request was dropped in favour of a conflicting one.
    Replaced { goal: GoalId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GoalOutput {
    Effect {
        goal: GoalId,
        run: RunId,
        effect: ProcedureEffect,
    },
    Event(GoalEvent),
}

struct Running {
    goal: GoalId,
    run: RunId,
    cancelling: bool,
    procedure: Box<dyn Procedure>,
}

#[derive(Debug)]
struct Pending {
    goal: GoalId,
    params: GoalParams,
}

pub struct GoalExecutor {
    factory: ProcedureFactory,
    running: Vec<Running>,
    queue: VecDeque<Pending>,
    next_run: u32,
}

impl fmt::Debug for GoalExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalExecutor")
            .field("goals", &self.snapshot())
            .finish()
    }
}

impl GoalExecutor {
    pub fn new(factory: ProcedureFactory) -> Self {
        Self {
            factory,
            running: Vec::new(),
            queue: VecDeque::new(),
            next_run: 0,
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    pub fn is_active(&self, goal: GoalId) -> bool {
        self.running.iter().any(|r| r.goal == goal && !r.cancelling)
    }

    pub fn is_cancelling(&self, goal: GoalId) -> bool {
        self.running.iter().any(|r| r.goal == goal && r.cancelling)
    }

    pub fn is_queued(&self, goal: GoalId) -> bool {
        self.queue.iter().any(|p| p.goal == goal)
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    pub fn snapshot(&self) -> GoalSnapshot {
        let running = self.running.iter().map(|r| {
            let state = if r.cancelling {
                GoalState::Cancelling
            } else {
                GoalState::Active
            };
            (r.goal, state)
        });
        let queued = self.queue.iter().map(|p| (p.goal, GoalState::Queued));
        GoalSnapshot {
            goals: running.chain(queued).collect(),
        }
    }

    // ── Requests ──────────────────────────────────────────────────────

    /// Queue `goal`, cancelling active conflicting goals and replacing
    /// queued ones.
    pub fn request(&mut self, goal: GoalId, params: GoalParams) -> (RequestOutcome, Vec<GoalOutput>) {
        if self.is_active(goal) || self.is_queued(goal) {
            debug!(?goal, "goal already pending, request ignored");
            return (RequestOutcome::Ignored, Vec::new());
        }

        let mut outputs = Vec::new();

        let mut replaced = Vec::new();
        self.queue.retain(|p| {
            let conflict = p.goal.conflicts_with(goal);
            if conflict {
                replaced.push(p.goal);
            }
            !conflict
        });
        for old in replaced {
            info!(goal = ?old, by = ?goal, "queued goal replaced");
            outputs.push(GoalOutput::Event(GoalEvent::Replaced { goal: old }));
        }

        let victims: Vec<RunId> = self
            .running
            .iter()
            .filter(|r| !r.cancelling && r.goal.conflicts_with(goal))
            .map(|r| r.run)
            .collect();
        for run in victims {
            self.cancel_run(run, &mut outputs);
        }

        debug!(?goal, ?params, "goal queued");
        self.queue.push_back(Pending { goal, params });
        self.dispatch(&mut outputs);
        (RequestOutcome::Accepted, outputs)
    }

    /// Cancel an active goal, or drop it from the queue.
    pub fn cancel(&mut self, goal: GoalId) -> Vec<GoalOutput> {
        let mut outputs = Vec::new();
        let before = self.queue.len();
        self.queue.retain(|p| p.goal != goal);
        if self.queue.len() != before {
            outputs.push(GoalOutput::Event(GoalEvent::Replaced { goal }));
        }
        let runs: Vec<RunId> = self
            .running
            .iter()
            .filter(|r| r.goal == goal && !r.cancelling)
            .map(|r| r.run)
            .collect();
        for run in runs {
            self.cancel_run(run, &mut outputs);
        }
        self.dispatch(&mut outputs);
        outputs
    }

    /// Drop every queued goal. Returns what was dropped.
    pub fn clear_queue(&mut self) -> Vec<GoalId> {
        self.queue.drain(..).map(|p| p.goal).collect()
    }

    // ── Procedure input ───────────────────────────────────────────────

    /// Offer `input` to every running procedure, in start order.
    pub fn deliver(&mut self, input: &ProcedureInput) -> Vec<GoalOutput> {
        let runs: Vec<RunId> = self.running.iter().map(|r| r.run).collect();
        let mut outputs = Vec::new();
        for run in runs {
            self.handle_run(run, input, &mut outputs);
        }
        self.dispatch(&mut outputs);
        outputs
    }

    /// Deliver `input` to one run; stale runs are ignored.
    pub fn deliver_to(&mut self, run: RunId, input: &ProcedureInput) -> Vec<GoalOutput> {
        let mut outputs = Vec::new();
        if !self.handle_run(run, input, &mut outputs) {
            debug!(?run, ?input, "input for finished run dropped");
        }
        self.dispatch(&mut outputs);
        outputs
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn index_of(&self, run: RunId) -> Option<usize> {
        self.running.iter().position(|r| r.run == run)
    }

    fn handle_run(&mut self, run: RunId, input: &ProcedureInput, outputs: &mut Vec<GoalOutput>) -> bool {
        let Some(idx) = self.index_of(run) else {
            return false;
        };
        let mut out = ProcedureOutput::new();
        self.running[idx].procedure.handle(input, &mut out);
        self.absorb(idx, out, outputs);
        true
    }

    fn cancel_run(&mut self, run: RunId, outputs: &mut Vec<GoalOutput>) {
        let Some(idx) = self.index_of(run) else {
            return;
        };
        let running = &mut self.running[idx];
        info!(goal = ?running.goal, ?run, "cancelling goal");
        running.cancelling = true;
        let mut out = ProcedureOutput::new();
        running.procedure.cancel(&mut out);
        self.absorb(idx, out, outputs);
    }

    fn can_start(&self, goal: GoalId) -> bool {
        self.running.iter().all(|r| goal.runs_alongside(r.goal))
    }

    /// Start queued goals in FIFO order until one has to wait.
    fn dispatch(&mut self, outputs: &mut Vec<GoalOutput>) {
        while let Some(front) = self.queue.front() {
            if !self.can_start(front.goal) {
                break;
            }
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            self.launch(pending, outputs);
        }
    }

    fn launch(&mut self, pending: Pending, outputs: &mut Vec<GoalOutput>) {
        let run = RunId(self.next_run);
        self.next_run = self.next_run.wrapping_add(1);
        let goal = pending.goal;
        info!(?goal, ?run, params = ?pending.params, "goal active");

        self.running.push(Running {
            goal,
            run,
            cancelling: false,
            procedure: (self.factory)(goal),
        });
        let idx = self.running.len() - 1;

        let mut out = ProcedureOutput::new();
        self.running[idx]
            .procedure
            .start(Completion::new(goal, run), pending.params, &mut out);

        let ok = out.started.unwrap_or(true);
        outputs.push(GoalOutput::Event(GoalEvent::Started { goal, run, ok }));
        if !ok && out.terminal.is_none() {
            warn!(?goal, "procedure refused to start");
            self.running.remove(idx);
            outputs.push(GoalOutput::Event(GoalEvent::Completed {
                goal,
                run,
                result: ProcedureResult::Failed,
            }));
            return;
        }
        self.absorb(idx, out, outputs);
    }

    /// Turn one procedure call's output into executor outputs, retiring the
    /// run if it finished.
    fn absorb(&mut self, idx: usize, out: ProcedureOutput, outputs: &mut Vec<GoalOutput>) {
        let Running {
            goal,
            run,
            cancelling,
            ..
        } = self.running[idx];

        outputs.extend(
            out.effects
                .into_iter()
                .map(|effect| GoalOutput::Effect { goal, run, effect }),
        );

        let Some(terminal) = out.terminal else {
            return;
        };
        debug_assert_eq!(terminal.run(), run, "completion token from another run");
        self.running.remove(idx);

        let result = terminal.result();
        let event = if cancelling {
            info!(?goal, ?run, "goal cancelled");
            GoalEvent::Cancelled { goal, run, result }
        } else {
            info!(?goal, ?run, ?result, "goal finished");
            GoalEvent::Completed { goal, run, result }
        };
        outputs.push(GoalOutput::Event(event));
    }
}
