/// Handover decision: watches both buds' physical state and handset link
/// metrics, and recommends handing the primary role to the peer.
///
/// Pure and clock-free. Every observation carries the time it was taken
/// (monotonic, any epoch), and the decider only ever compares those times.
///
/// Each evaluation collects candidate recommendations and keeps the most
/// urgent one:
///
/// | Reason         | Condition                                              | Urgency  |
/// |----------------|--------------------------------------------------------|----------|
/// | `InCase`       | this bud in the case, peer out                         | critical |
/// | `BatteryLevel` | this battery critical, peer known and not critical     | high     |
/// | `OutOfEar`     | this bud out of ear past the grace period, peer in ear | high     |
/// | `Rssi`         | filtered RSSI critical and link quality agrees         | critical |
/// | `LinkQuality`  | filtered link quality critical                         | critical |
/// | `VoiceQuality` | during a call, peer voice quality clearly better       | any      |
///
/// Good local voice quality suppresses less urgent recommendations during a
/// call. A recommendation is not repeated within a per-urgency suppression
/// period; when no reason remains, an outstanding recommendation is
/// withdrawn.
use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::types::HandoverReason;

/// Voice quality reported when the codec has no estimate.
pub const UNKNOWN_VOICE_QUALITY: u8 = 0xFF;

/// Which earbud an observation is about, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bud {
    Local,
    Peer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatteryState {
    #[default]
    Unknown,
    Unsafe,
    Critical,
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub reason: HandoverReason,
    pub urgency: Urgency,
}

impl Recommendation {
    pub const fn new(reason: HandoverReason, urgency: Urgency) -> Self {
        Self { reason, urgency }
    }
}

/// One sensor or link report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    InEar { bud: Bud, in_ear: bool },
    InCase { bud: Bud, in_case: bool },
    Battery { bud: Bud, state: BatteryState },
    /// Uplink voice quality during a call, 0 (worst) to 15 (best).
    VoiceQuality { bud: Bud, quality: u8 },
    /// Handset link metrics. A `link_quality` of 0 means unknown.
    LinkQuality { bud: Bud, rssi: i8, link_quality: u16 },
    Call { active: bool },
    /// The application asks for a handover.
    External { urgency: Urgency },
}

/// Result of feeding the decider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Handover(Recommendation),
    /// The outstanding recommendation no longer holds.
    Withdraw,
    Unchanged,
}

// ── Configuration ─────────────────────────────────────────────────────

/// Filter window and thresholds for one urgency level of one metric.
///
/// Samples older than `max_age` are dropped; newer ones lose half their
/// weight every `half_life`. The peer is better when this bud's filtered
/// value is below `absolute` and the peer's beats it by more than `relative`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityLevel {
    pub half_life: Duration,
    pub max_age: Duration,
    pub absolute: i32,
    pub relative: i32,
}

impl QualityLevel {
    pub const fn new(half_life_ms: u64, max_age_ms: u64, absolute: i32, relative: i32) -> Self {
        Self {
            half_life: Duration::from_millis(half_life_ms),
            max_age: Duration::from_millis(max_age_ms),
            absolute,
            relative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityLevels {
    pub critical: QualityLevel,
    pub high: QualityLevel,
    pub low: QualityLevel,
}

impl QualityLevels {
    /// Most urgent first.
    fn ordered(&self) -> [(Urgency, &QualityLevel); 3] {
        [
            (Urgency::Critical, &self.critical),
            (Urgency::High, &self.high),
            (Urgency::Low, &self.low),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionConfig {
    /// Observations closer together than this are recorded but not evaluated.
    pub min_update_interval: Duration,
    /// How long this bud must be out of ear before handing over to an in-ear peer.
    pub out_of_ear_grace: Duration,
    /// Repeat suppression per urgency.
    pub suppress_low: Duration,
    pub suppress_high: Duration,
    pub suppress_critical: Duration,
    /// Assumed in-ear state when no sensor reported yet.
    pub in_ear_fallback: bool,
    /// Samples kept per metric and bud.
    pub history: usize,
    pub voice: QualityLevels,
    pub rssi: QualityLevels,
    pub link_quality: QualityLevels,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_update_interval: Duration::from_millis(500),
            out_of_ear_grace: Duration::from_secs(3),
            suppress_low: Duration::from_secs(10),
            suppress_high: Duration::from_secs(5),
            suppress_critical: Duration::from_secs(1),
            in_ear_fallback: true,
            history: 10,
            voice: QualityLevels {
                critical: QualityLevel::new(1_000, 3_000, 4, 6),
                high: QualityLevel::new(2_000, 6_000, 6, 4),
                low: QualityLevel::new(4_000, 12_000, 8, 3),
            },
            rssi: QualityLevels {
                critical: QualityLevel::new(1_000, 3_000, -85, 15),
                high: QualityLevel::new(2_000, 6_000, -80, 10),
                low: QualityLevel::new(4_000, 12_000, -75, 8),
            },
            link_quality: QualityLevels {
                critical: QualityLevel::new(1_000, 3_000, 30_000, 20_000),
                high: QualityLevel::new(2_000, 6_000, 40_000, 15_000),
                low: QualityLevel::new(4_000, 12_000, 50_000, 10_000),
            },
        }
    }
}

// ── Sample history ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Duration,
    value: i32,
}

#[derive(Debug, Default)]
struct History {
    samples: VecDeque<Sample>,
}

impl History {
    fn push(&mut self, at: Duration, value: i32, capacity: usize) {
        while self.samples.len() >= capacity.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at, value });
    }

    fn clear(&mut self) {
        self.samples.clear();
    }

    /// Weighted average at `now`, newest samples weighing most. `None` when
    /// no sample is young enough.
    fn filtered(&self, now: Duration, level: &QualityLevel) -> Option<i32> {
        let half = level.half_life.as_millis().max(1) as i64;
        let max_age = level.max_age.as_millis() as i64;
        let mut total = 0i64;
        let mut weight = 0i64;
        for sample in self.samples.iter().rev() {
            let age = now.saturating_sub(sample.at).as_millis() as i64;
            if age > max_age {
                break;
            }
            let halvings = (age / half).min(10);
            let mut w = 1i64 << (10 - halvings);
            // Quarter-step rounding between whole half lives.
            let residual_x4 = 4 * (age - halvings * half);
            if residual_x4 > 3 * half {
                w >>= 1;
            } else if residual_x4 > half {
                w = (w * 724) >> 10;
            }
            total += w * sample.value as i64;
            weight += w;
        }
        (weight > 0).then(|| (total as f64 / weight as f64).round() as i32)
    }
}

// ── Per-bud state ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct BudInfo {
    in_ear: Option<bool>,
    in_case: bool,
    battery: BatteryState,
    last_in_ear: Option<Duration>,
    voice: History,
    rssi: History,
    link: History,
}

impl BudInfo {
    fn is_in_ear(&self, fallback: bool) -> bool {
        !self.in_case && self.in_ear.unwrap_or(fallback)
    }
}

/// Whether the peer's filtered value beats ours at `level`.
fn peer_is_better(ours: Option<i32>, theirs: Option<i32>, level: &QualityLevel) -> bool {
    match (ours, theirs) {
        (Some(ours), Some(theirs)) => ours < level.absolute && theirs - ours > level.relative,
        _ => false,
    }
}

fn merge(current: &mut Option<Recommendation>, candidate: Recommendation) {
    if current.map_or(true, |c| candidate.urgency > c.urgency) {
        *current = Some(candidate);
    }
}

// ── HandoverDecider ───────────────────────────────────────────────────

#[derive(Debug)]
pub struct HandoverDecider {
    config: DecisionConfig,
    local: BudInfo,
    peer: BudInfo,
    in_call: bool,
    current: Option<Recommendation>,
    last_update: Option<Duration>,
    last_attempt: Option<Duration>,
    /// An observation arrived inside the update interval and is not evaluated yet.
    stale: bool,
}

impl HandoverDecider {
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            local: BudInfo::default(),
            peer: BudInfo::default(),
            in_call: false,
            current: None,
            last_update: None,
            last_attempt: None,
            stale: false,
        }
    }

    pub fn current(&self) -> Option<Recommendation> {
        self.current
    }

    pub fn in_call(&self) -> bool {
        self.in_call
    }

    /// Forget outstanding recommendations and link history. Physical state
    /// and battery levels are kept.
    pub fn reset(&mut self) {
        self.current = None;
        self.last_attempt = None;
        self.last_update = None;
        self.stale = false;
        for bud in [&mut self.local, &mut self.peer] {
            bud.voice.clear();
            bud.rssi.clear();
            bud.link.clear();
        }
    }

    fn bud_mut(&mut self, bud: Bud) -> &mut BudInfo {
        match bud {
            Bud::Local => &mut self.local,
            Bud::Peer => &mut self.peer,
        }
    }

    fn in_ear(&self, bud: Bud) -> bool {
        let info = match bud {
            Bud::Local => &self.local,
            Bud::Peer => &self.peer,
        };
        info.is_in_ear(self.config.in_ear_fallback)
    }

    /// Record an observation taken at `at` and re-evaluate.
    pub fn observe(&mut self, at: Duration, observation: Observation) -> Decision {
        let fallback = self.config.in_ear_fallback;
        for bud in [&mut self.local, &mut self.peer] {
            if bud.is_in_ear(fallback) {
                bud.last_in_ear = Some(at);
            }
        }
        let capacity = self.config.history;
        match observation {
            Observation::InEar { bud, in_ear } => self.bud_mut(bud).in_ear = Some(in_ear),
            Observation::InCase { bud, in_case } => self.bud_mut(bud).in_case = in_case,
            Observation::Battery { bud, state } => self.bud_mut(bud).battery = state,
            Observation::VoiceQuality { bud, quality } => {
                if quality != UNKNOWN_VOICE_QUALITY {
                    self.bud_mut(bud).voice.push(at, quality as i32, capacity);
                }
            }
            Observation::LinkQuality {
                bud,
                rssi,
                link_quality,
            } => {
                let info = self.bud_mut(bud);
                info.rssi.push(at, rssi as i32, capacity);
                if link_quality != 0 {
                    info.link.push(at, link_quality as i32, capacity);
                }
            }
            Observation::Call { active } => self.in_call = active,
            Observation::External { urgency } => {
                self.last_update = Some(at);
                return self.offer(at, Recommendation::new(HandoverReason::External, urgency));
            }
        }
        self.update(at)
    }

    /// Re-evaluate everything at `at`.
    pub fn update(&mut self, at: Duration) -> Decision {
        if let Some(last) = self.last_update {
            if at.saturating_sub(last) < self.config.min_update_interval {
                trace!(?at, "evaluation throttled");
                self.stale = true;
                return Decision::Unchanged;
            }
        }
        self.last_update = Some(at);
        self.stale = false;

        let fallback = self.config.in_ear_fallback;
        let local_in_ear = self.in_ear(Bud::Local);
        let peer_in_ear = self.in_ear(Bud::Peer);
        let mut result = None;

        if self.local.in_case && !self.peer.in_case {
            merge(&mut result, Recommendation::new(HandoverReason::InCase, Urgency::Critical));
        }

        if self.local.battery == BatteryState::Critical
            && !matches!(self.peer.battery, BatteryState::Critical | BatteryState::Unknown)
        {
            if local_in_ear && !peer_in_ear {
                debug!("battery critical but the peer is out of ear");
            } else {
                merge(&mut result, Recommendation::new(HandoverReason::BatteryLevel, Urgency::High));
            }
        }

        for bud in [&mut self.local, &mut self.peer] {
            if bud.is_in_ear(fallback) {
                bud.last_in_ear = Some(at);
            }
        }

        if !local_in_ear && peer_in_ear {
            let out_for = self.local.last_in_ear.map(|t| at.saturating_sub(t));
            if out_for.map_or(true, |d| d >= self.config.out_of_ear_grace) {
                merge(&mut result, Recommendation::new(HandoverReason::OutOfEar, Urgency::High));
            }
        }

        let peer_unusable = (local_in_ear && !peer_in_ear)
            || self.peer.in_case
            || self.peer.battery == BatteryState::Critical;
        if !peer_unusable {
            if let Some(link) = self.link_verdict(at) {
                merge(&mut result, link);
            }
        }

        if self.in_call && !self.peer.in_case {
            let (urgency, suppress) = self.voice_verdict(at);
            if let Some(urgency) = urgency {
                merge(&mut result, Recommendation::new(HandoverReason::VoiceQuality, urgency));
            }
            if let Some(suppress) = suppress.filter(|s| *s > Urgency::Low) {
                if result.map_or(false, |r| r.urgency < suppress) {
                    debug!(?result, ?suppress, "local voice quality suppresses handover");
                    result = None;
                }
            }
        }

        if result.is_none() {
            result = self.current.filter(|c| c.reason == HandoverReason::External);
        }

        match result {
            Some(recommendation) => self.offer(at, recommendation),
            None => self.withdraw(),
        }
    }

    /// Delay after which [`update`](Self::update) should run again without
    /// a new observation, if something is waiting on time alone.
    pub fn recheck_after(&self, at: Duration) -> Option<Duration> {
        let mut next: Option<Duration> = None;
        if self.stale {
            if let Some(last) = self.last_update {
                next = Some((last + self.config.min_update_interval).saturating_sub(at));
            }
        }
        let waiting_out_of_ear = !self.in_ear(Bud::Local)
            && self.in_ear(Bud::Peer)
            && self.current.map_or(true, |c| c.reason != HandoverReason::OutOfEar);
        if waiting_out_of_ear {
            if let Some(since) = self.local.last_in_ear {
                let due = (since + self.config.out_of_ear_grace).saturating_sub(at);
                if !due.is_zero() {
                    next = Some(next.map_or(due, |n| n.min(due)));
                }
            }
        }
        next
    }

    fn link_verdict(&self, at: Duration) -> Option<Recommendation> {
        let rssi = self.first_level(&self.config.rssi, at, |bud| &bud.rssi);
        let link = self.first_level(&self.config.link_quality, at, |bud| &bud.link);
        match (rssi, link) {
            // Link quality must agree before RSSI alone moves the role.
            (_, None) => None,
            (Some(Urgency::Critical), Some(_)) => {
                Some(Recommendation::new(HandoverReason::Rssi, Urgency::Critical))
            }
            (_, Some(Urgency::Critical)) => {
                Some(Recommendation::new(HandoverReason::LinkQuality, Urgency::Critical))
            }
            _ => None,
        }
    }

    /// Most urgent level at which the peer's metric beats ours.
    fn first_level(
        &self,
        levels: &QualityLevels,
        at: Duration,
        metric: impl Fn(&BudInfo) -> &History,
    ) -> Option<Urgency> {
        levels.ordered().into_iter().find_map(|(urgency, level)| {
            let ours = metric(&self.local).filtered(at, level);
            let theirs = metric(&self.peer).filtered(at, level);
            peer_is_better(ours, theirs, level).then_some(urgency)
        })
    }

    /// `(handover urgency, suppression urgency)`. Clearly better local voice
    /// suppresses other recommendations below its level.
    fn voice_verdict(&self, at: Duration) -> (Option<Urgency>, Option<Urgency>) {
        for (urgency, level) in self.config.voice.ordered() {
            let ours = self.local.voice.filtered(at, level);
            let theirs = self.peer.voice.filtered(at, level);
            if peer_is_better(ours, theirs, level) {
                return (Some(urgency), None);
            }
            if peer_is_better(theirs, ours, level) {
                return (None, Some(urgency));
            }
        }
        (None, None)
    }

    fn offer(&mut self, at: Duration, recommendation: Recommendation) -> Decision {
        let period = match recommendation.urgency {
            Urgency::Low => self.config.suppress_low,
            Urgency::High => self.config.suppress_high,
            Urgency::Critical => self.config.suppress_critical,
        };
        if let Some(last) = self.last_attempt {
            if at.saturating_sub(last) < period {
                trace!(?recommendation, "recommended recently, holding");
                return Decision::Unchanged;
            }
        }
        self.current = Some(recommendation);
        self.last_attempt = Some(at);
        info!(reason = ?recommendation.reason, urgency = ?recommendation.urgency, "handover recommended");
        Decision::Handover(recommendation)
    }

    fn withdraw(&mut self) -> Decision {
        match self.current.take() {
            Some(previous) => {
                info!(reason = ?previous.reason, "handover recommendation withdrawn");
                Decision::Withdraw
            }
            None => Decision::Unchanged,
        }
    }
}
