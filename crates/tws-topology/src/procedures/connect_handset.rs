/// Connect-handset procedure.
///
/// Asks the handset service to reconnect the paired handset(s). If
/// multipoint audio starts while the reconnect is outstanding, the reconnect
/// is suspended and a bounded wait is armed: audio stopping resumes the
/// reconnect, the wait expiring fails the procedure.
///
/// The reconnect and a requested stop are both bounded by the confirm
/// timeout. A reconnect that never confirms is stopped and times out; a stop
/// that never confirms is taken as done.
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::goals::GoalParams;
use crate::services::{Indication, ServiceRequest};
use crate::types::{ProcedureResult, Profiles};

use super::{finish_once, Completion, Procedure, ProcedureInput, ProcedureOutput, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// `Confirm` armed.
    Reconnecting,
    /// Reconnect stopped while audio plays; `AudioWait` armed.
    SuspendedForAudio,
    /// Cancel requested; waiting for the reconnect to stop. `Confirm` armed.
    Stopping,
}

#[derive(Debug)]
pub struct ConnectHandset {
    default_profiles: Profiles,
    profiles: Profiles,
    audio_wait: Duration,
    confirm: Duration,
    phase: Phase,
    completion: Option<Completion>,
}

impl ConnectHandset {
    pub fn new(default_profiles: Profiles, audio_wait: Duration, confirm: Duration) -> Self {
        Self {
            default_profiles,
            profiles: default_profiles,
            audio_wait,
            confirm,
            phase: Phase::Idle,
            completion: None,
        }
    }

    fn reconnect(&mut self, out: &mut ProcedureOutput) {
        out.request(ServiceRequest::ReconnectHandset {
            profiles: self.profiles,
        });
        out.start_timer(TimerKind::Confirm, self.confirm);
        self.phase = Phase::Reconnecting;
    }

    fn finish(&mut self, result: ProcedureResult, out: &mut ProcedureOutput) {
        match self.phase {
            Phase::SuspendedForAudio => out.cancel_timer(TimerKind::AudioWait),
            Phase::Reconnecting | Phase::Stopping => out.cancel_timer(TimerKind::Confirm),
            Phase::Idle => {}
        }
        self.phase = Phase::Idle;
        finish_once(&mut self.completion, result, out);
    }
}

impl Procedure for ConnectHandset {
    fn start(&mut self, completion: Completion, params: GoalParams, out: &mut ProcedureOutput) {
        self.completion = Some(completion);
        self.profiles = match params {
            GoalParams::Profiles(p) if !p.is_empty() => p,
            _ => self.default_profiles,
        };
        info!(profiles = ?self.profiles, "connecting handset");
        self.reconnect(out);
        out.ack_start(true);
    }

    fn cancel(&mut self, out: &mut ProcedureOutput) {
        match self.phase {
            Phase::Reconnecting => {
                out.request(ServiceRequest::StopReconnect);
                out.start_timer(TimerKind::Confirm, self.confirm);
                self.phase = Phase::Stopping;
            }
            // Nothing outstanding with the handset service.
            Phase::SuspendedForAudio => self.finish(ProcedureResult::Success, out),
            Phase::Idle | Phase::Stopping => {}
        }
    }

    fn handle(&mut self, input: &ProcedureInput, out: &mut ProcedureOutput) {
        if self.completion.is_none() {
            return;
        }
        match (self.phase, input) {
            (Phase::Reconnecting, ProcedureInput::Indication(Indication::AudioStarted)) => {
                debug!(wait = ?self.audio_wait, "audio started, suspending handset reconnect");
                out.cancel_timer(TimerKind::Confirm);
                out.request(ServiceRequest::StopReconnect);
                out.start_timer(TimerKind::AudioWait, self.audio_wait);
                self.phase = Phase::SuspendedForAudio;
            }
            (Phase::SuspendedForAudio, ProcedureInput::Indication(Indication::AudioStopped)) => {
                debug!("audio stopped, resuming handset reconnect");
                out.cancel_timer(TimerKind::AudioWait);
                self.reconnect(out);
            }
            (Phase::SuspendedForAudio, ProcedureInput::Timer(TimerKind::AudioWait)) => {
                info!("audio outlasted the reconnect window");
                self.phase = Phase::Idle;
                finish_once(&mut self.completion, ProcedureResult::Failed, out);
            }
            (Phase::Reconnecting, ProcedureInput::Indication(Indication::ReconnectCfm { ok })) => {
                let result = if *ok {
                    ProcedureResult::Success
                } else {
                    ProcedureResult::Failed
                };
                self.finish(result, out);
            }
            (Phase::Reconnecting, ProcedureInput::Timer(TimerKind::Confirm)) => {
                warn!(after = ?self.confirm, "handset reconnect not confirmed, stopping it");
                out.request(ServiceRequest::StopReconnect);
                self.phase = Phase::Idle;
                finish_once(&mut self.completion, ProcedureResult::Timeout, out);
            }
            // Stop confirmed, or the reconnect finished before the stop took effect.
            (Phase::Stopping, ProcedureInput::Indication(Indication::ReconnectStopped))
            | (Phase::Stopping, ProcedureInput::Indication(Indication::ReconnectCfm { .. })) => {
                self.finish(ProcedureResult::Success, out);
            }
            (Phase::Stopping, ProcedureInput::Timer(TimerKind::Confirm)) => {
                warn!("reconnect stop not confirmed");
                self.phase = Phase::Idle;
                finish_once(&mut self.completion, ProcedureResult::Success, out);
            }
            _ => {}
        }
    }
}
