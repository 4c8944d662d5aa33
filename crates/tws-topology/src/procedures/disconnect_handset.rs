/// Disconnect all handsets, or only the least recently used one.
use std::time::Duration;

use tracing::info;

use crate::goals::GoalParams;
use crate::services::{Indication, ServiceRequest};
use crate::types::ProcedureResult;

use super::{finish_once, Completion, Procedure, ProcedureInput, ProcedureOutput, TimerKind};

#[derive(Debug)]
pub struct DisconnectHandset {
    lru: bool,
    confirm_timeout: Duration,
    completion: Option<Completion>,
}

impl DisconnectHandset {
    pub fn all(confirm_timeout: Duration) -> Self {
        Self {
            lru: false,
            confirm_timeout,
            completion: None,
        }
    }

    pub fn lru(confirm_timeout: Duration) -> Self {
        Self {
            lru: true,
            ..Self::all(confirm_timeout)
        }
    }
}

impl Procedure for DisconnectHandset {
    fn start(&mut self, completion: Completion, _params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        info!(lru = self.lru, "disconnecting handset");
        out.request(if self.lru {
            ServiceRequest::DisconnectLruHandset
        } else {
            ServiceRequest::DisconnectHandsets
        });
        out.start_timer(TimerKind::Confirm, self.confirm_timeout);
        out.ack_start(true);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        // The confirmation of a superseded disconnect is of no interest.
        out.cancel_timer(TimerKind::Confirm);
        finish_once(&mut self.completion, ProcedureResult::Success, out);
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        match input {
            ProcedureInput::Indication(Indication::DisconnectCfm { lru, ok }) if *lru == self.lru => {
                out.cancel_timer(TimerKind::Confirm);
                let result = if *ok {
                    ProcedureResult::Success
                } else {
                    ProcedureResult::Failed
                };
                finish_once(&mut self.completion, result, out);
            }
            ProcedureInput::Timer(TimerKind::Confirm) => {
                finish_once(&mut self.completion, ProcedureResult::Timeout, out);
            }
            _ => {}
        }
    }
}
