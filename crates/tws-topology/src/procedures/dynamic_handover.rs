/// Dynamic handover procedure.
///
/// Drives the handover coordinator on the outgoing (current primary) side.
/// Vetoes and timeouts are retried after a delay up to a maximum number of
/// attempts; any other failure ends the procedure at once. A withdrawn
/// recommendation ends the procedure while it waits for a re-attempt.
use std::time::Duration;

use tracing::{info, warn};

use crate::goals::GoalParams;
use crate::handover::HandoverOutcome;
use crate::types::{HandoverReason, ProcedureResult};

use super::{
    finish_once, Completion, Procedure, ProcedureEffect, ProcedureInput, ProcedureOutput,
    TimerKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    WaitingRetry,
    /// Cancel sent to the coordinator; waiting for its outcome.
    Aborting,
}

#[derive(Debug)]
pub struct DynamicHandover {
    reason: HandoverReason,
    max_retries: u8,
    retry_delay: Duration,
    retries: u8,
    phase: Phase,
    completion: Option<Completion>,
}

impl DynamicHandover {
    pub fn new(max_retries: u8, retry_delay: Duration) -> Self {
        Self {
            reason: HandoverReason::External,
            max_retries,
            retry_delay,
            retries: 0,
            phase: Phase::Idle,
            completion: None,
        }
    }

    fn attempt(&mut self, out: &mut ProcedureOutput) {
        out.push(ProcedureEffect::StartHandover {
            reason: self.reason,
        });
        self.phase = Phase::Running;
    }

    fn finish(&mut self, result: ProcedureResult, out: &mut ProcedureOutput) {
        self.phase = Phase::Idle;
        finish_once(&mut self.completion, result, out);
    }
}

impl Procedure for DynamicHandover {
    fn start(&mut self, completion: Completion, params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        if let GoalParams::Handover(reason) = params {
            self.reason = reason;
        }
        self.retries = 0;
        info!(reason = ?self.reason, "starting dynamic handover");
        out.ack_start(true);
        self.attempt(out);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        match self.phase {
            Phase::Running => {
                out.push(ProcedureEffect::CancelHandover);
                self.phase = Phase::Aborting;
            }
            Phase::WaitingRetry => {
                out.cancel_timer(TimerKind::Retry);
                self.finish(ProcedureResult::Failed, out);
            }
            Phase::Idle | Phase::Aborting => {}
        }
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        match (self.phase, input) {
            (Phase::Running | Phase::Aborting, ProcedureInput::Handover(outcome)) => match outcome {
                HandoverOutcome::Committed { .. } => self.finish(ProcedureResult::Success, out),
                HandoverOutcome::Failed { error, .. }
                    if self.phase == Phase::Running && error.is_retryable() =>
                {
                    if self.retries < self.max_retries {
                        self.retries += 1;
                        warn!(%error, attempt = self.retries, max = self.max_retries, "handover not possible now, retrying");
                        out.start_timer(TimerKind::Retry, self.retry_delay);
                        self.phase = Phase::WaitingRetry;
                    } else {
                        warn!(%error, "handover retries exhausted");
                        self.finish(ProcedureResult::Failed, out);
                    }
                }
                HandoverOutcome::Failed { error, .. } => {
                    warn!(%error, "handover failed");
                    self.finish(ProcedureResult::Failed, out);
                }
            },
            (Phase::WaitingRetry, ProcedureInput::Timer(TimerKind::Retry)) => self.attempt(out),
            (Phase::WaitingRetry, ProcedureInput::HandoverWithdrawn) => {
                info!("handover no longer wanted, not retrying");
                out.cancel_timer(TimerKind::Retry);
                self.finish(ProcedureResult::Failed, out);
            }
            _ => {}
        }
    }
}
