/// Ordered request/confirm steps: the settings procedures, system stop and
/// the idle procedure are all "ask a service, wait for its confirmation,
/// move on".
use std::time::Duration;

use tracing::debug;

use crate::goals::GoalParams;
use crate::services::{Indication, ServiceRequest, Setting};
use crate::types::ProcedureResult;

use super::{finish_once, Completion, Procedure, ProcedureInput, ProcedureOutput, TimerKind};

/// Confirmation a step waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Configured(Setting),
    HandsetsDisconnected,
    PeerProfilesDisconnected,
}

impl Expect {
    fn matches(self, ind: &Indication) -> bool {
        match (self, ind) {
            (Expect::Configured(want), Indication::Configured { setting }) => want == *setting,
            (Expect::HandsetsDisconnected, Indication::DisconnectCfm { lru: false, .. }) => true,
            (Expect::PeerProfilesDisconnected, Indication::PeerProfilesDisconnected) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    request: ServiceRequest,
    expect: Expect,
}

impl Step {
    pub fn new(request: ServiceRequest, expect: Expect) -> Self {
        Self { request, expect }
    }

    pub fn configure(setting: Setting, enable: bool) -> Self {
        Self::new(
            ServiceRequest::Configure { setting, enable },
            Expect::Configured(setting),
        )
    }
}

#[derive(Debug)]
pub struct Sequence {
    name: &'static str,
    steps: Vec<Step>,
    /// Single-setting procedures take the on/off value from the goal params.
    setting: Option<Setting>,
    next: usize,
    confirm_timeout: Duration,
    completion: Option<Completion>,
}

impl Sequence {
    pub fn new(name: &'static str, steps: Vec<Step>, confirm_timeout: Duration) -> Self {
        Self {
            name,
            steps,
            setting: None,
            next: 0,
            confirm_timeout,
            completion: None,
        }
    }

    /// One `Configure` step whose value is `GoalParams::Enable` (default on).
    pub fn setting(name: &'static str, setting: Setting, confirm_timeout: Duration) -> Self {
        Self {
            setting: Some(setting),
            ..Self::new(name, Vec::new(), confirm_timeout)
        }
    }

    fn issue_next(&mut self, out: &mut ProcedureOutput) {
        match self.steps.get(self.next) {
            Some(step) => {
                debug!(procedure = self.name, step = self.next, request = ?step.request, "sequence step");
                out.request(step.request.clone());
                out.start_timer(TimerKind::Confirm, self.confirm_timeout);
            }
            None => {
                out.cancel_timer(TimerKind::Confirm);
                finish_once(&mut self.completion, ProcedureResult::Success, out);
            }
        }
    }
}

impl Procedure for Sequence {
    fn start(&mut self, completion: Completion, params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        if let Some(setting) = self.setting {
            let enable = match params {
                GoalParams::Enable(enable) => enable,
                _ => true,
            };
            self.steps = vec![Step::configure(setting, enable)];
        }
        self.next = 0;
        out.ack_start(true);
        self.issue_next(out);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        // Requests already issued are idempotent settings; stop issuing more.
        out.cancel_timer(TimerKind::Confirm);
        finish_once(&mut self.completion, ProcedureResult::Success, out);
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        match input {
            ProcedureInput::Indication(ind) => {
                let Some(step) = self.steps.get(self.next) else {
                    return;
                };
                if step.expect.matches(ind) {
                    self.next += 1;
                    self.issue_next(out);
                }
            }
            ProcedureInput::Timer(TimerKind::Confirm) => {
                debug!(procedure = self.name, step = self.next, "confirmation timed out");
                finish_once(&mut self.completion, ProcedureResult::Timeout, out);
            }
            _ => {}
        }
    }
}
