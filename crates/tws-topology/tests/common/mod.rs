//! Shared fixtures for the integration tests: profile participants with
//! inspectable live tables, a healthy service stack, and a synchronous
//! bench that wires one or two `TopologyState`s together.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tws_topology::runtime::{DeliveryTag, TimerToken, TopologyEffect};
use tws_topology::{
    DeviceId, Indication, ParticipantRegistry, ProfileParticipant, ProfileState, Role,
    ServiceRequest, TopologyCommand, TopologyConfig, TopologyEvent, TopologyState,
};

pub const PHONE: DeviceId = DeviceId::new(0);
pub const TABLET: DeviceId = DeviceId::new(1);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Timeouts short enough for tests that run on the real clock.
pub fn fast_config() -> TopologyConfig {
    TopologyConfig::new()
        .protocol_timeout(Duration::from_millis(300))
        .handover_retry_delay(Duration::from_millis(20))
        .marshal_chunk_size(8)
}

// ── Profile participants ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub cid: u16,
    pub codec: String,
    pub volume: u8,
}

#[derive(Debug, Default)]
pub struct AudioTables {
    pub streams: HashMap<DeviceId, Stream>,
    /// Refuse handover (e.g. a codec renegotiation in flight).
    pub busy: bool,
    pub installs: usize,
    pub releases: usize,
}

/// A2DP-like profile whose live tables stay visible to the test after the
/// participant moved into a registry.
#[derive(Debug, Clone, Default)]
pub struct A2dp(pub Arc<Mutex<AudioTables>>);

impl A2dp {
    pub fn streaming(device: DeviceId) -> Self {
        let a2dp = Self::default();
        a2dp.0.lock().unwrap().streams.insert(
            device,
            Stream {
                cid: 0x41,
                codec: "aac".into(),
                volume: 9,
            },
        );
        a2dp
    }

    pub fn stream(&self, device: DeviceId) -> Option<Stream> {
        self.0.lock().unwrap().streams.get(&device).cloned()
    }

    pub fn set_busy(&self, busy: bool) {
        self.0.lock().unwrap().busy = busy;
    }

    pub fn installs(&self) -> usize {
        self.0.lock().unwrap().installs
    }
}

impl ProfileState for A2dp {
    type Snapshot = Stream;
    const NAME: &'static str = "a2dp";

    fn veto(&self) -> bool {
        self.0.lock().unwrap().busy
    }

    fn snapshot(&self, device: DeviceId) -> Option<Stream> {
        self.stream(device)
    }

    fn install(&mut self, device: DeviceId, snapshot: Stream) {
        let mut tables = self.0.lock().unwrap();
        tables.streams.insert(device, snapshot);
        tables.installs += 1;
    }

    fn release(&mut self, device: DeviceId) {
        let mut tables = self.0.lock().unwrap();
        tables.streams.remove(&device);
        tables.releases += 1;
    }
}

/// HFP-like profile: speaker gain per device.
#[derive(Debug, Clone, Default)]
pub struct Hfp(pub Arc<Mutex<HashMap<DeviceId, u8>>>);

impl Hfp {
    pub fn gain(&self, device: DeviceId) -> Option<u8> {
        self.0.lock().unwrap().get(&device).copied()
    }
}

impl ProfileState for Hfp {
    type Snapshot = u8;
    const NAME: &'static str = "hfp";

    fn snapshot(&self, device: DeviceId) -> Option<u8> {
        self.gain(device)
    }

    fn install(&mut self, device: DeviceId, gain: u8) {
        self.0.lock().unwrap().insert(device, gain);
    }

    fn release(&mut self, device: DeviceId) {
        self.0.lock().unwrap().remove(&device);
    }
}

pub fn registry(a2dp: &A2dp, hfp: &Hfp) -> ParticipantRegistry {
    ParticipantRegistry::new()
        .with(ProfileParticipant::new(a2dp.clone()))
        .with(ProfileParticipant::new(hfp.clone()))
}

// ── Service stack ─────────────────────────────────────────────────────

/// Answers of a healthy stack with `device` in range. `lru` is the
/// device an LRU disconnect would drop. Role discovery is never answered.
pub fn answer(request: &ServiceRequest, device: DeviceId, lru: Option<DeviceId>) -> Vec<Indication> {
    match request {
        ServiceRequest::Configure { setting, .. } => vec![Indication::Configured { setting: *setting }],
        ServiceRequest::ReconnectHandset { .. } => vec![
            Indication::HandsetConnected { device },
            Indication::ReconnectCfm { ok: true },
        ],
        ServiceRequest::StopReconnect => vec![Indication::ReconnectStopped],
        ServiceRequest::DisconnectHandsets => vec![
            Indication::HandsetDisconnected {
                device,
                link_loss: false,
            },
            Indication::DisconnectCfm { lru: false, ok: true },
        ],
        ServiceRequest::DisconnectLruHandset => match lru {
            Some(device) => vec![
                Indication::HandsetDisconnected {
                    device,
                    link_loss: false,
                },
                Indication::DisconnectCfm { lru: true, ok: true },
            ],
            None => vec![Indication::DisconnectCfm { lru: true, ok: false }],
        },
        ServiceRequest::ConnectPeerProfiles => vec![Indication::PeerProfilesConnected { ok: true }],
        ServiceRequest::DisconnectPeerProfiles => vec![Indication::PeerProfilesDisconnected],
        ServiceRequest::FindRole
        | ServiceRequest::CancelFindRole
        | ServiceRequest::RetainLink { .. }
        | ServiceRequest::ReleaseLink { .. } => Vec::new(),
    }
}

// ── Synchronous bench ─────────────────────────────────────────────────

pub struct Node {
    pub state: TopologyState,
    pub a2dp: A2dp,
    pub hfp: Hfp,
    /// Requests this node's stack sits on until `answer_held`.
    pub holds: fn(&ServiceRequest) -> bool,
    pub held: Vec<ServiceRequest>,
    pub requests: Vec<ServiceRequest>,
    pub events: Vec<TopologyEvent>,
    pub timers: Vec<(TimerToken, Duration)>,
}

impl Node {
    pub fn handover_events(&self) -> impl Iterator<Item = &TopologyEvent> {
        self.events.iter().filter(|e| {
            matches!(
                e,
                TopologyEvent::HandoverStarted { .. }
                    | TopologyEvent::HandoverCompleted { .. }
                    | TopologyEvent::HandoverFailed { .. }
            )
        })
    }
}

enum Work {
    Effect(usize, TopologyEffect),
    Indicate(usize, Indication),
}

/// Runs one or two nodes to quiescence on the calling thread. Peer frames
/// travel through the real wire encoding.
pub struct Bench {
    pub nodes: Vec<Node>,
    pub link_up: bool,
    /// Drop the peer link once this many more frames got through.
    pub drop_after: Option<usize>,
    /// Keep the next commit frame in flight until `release_commit`.
    pub hold_commit: bool,
    held_commit: Option<(usize, tws_topology::PeerMessage, DeliveryTag)>,
    pub frames: usize,
    work: VecDeque<Work>,
}

impl Bench {
    pub fn new(nodes: Vec<(A2dp, Hfp)>, config: TopologyConfig) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|(a2dp, hfp)| Node {
                state: TopologyState::new(registry(&a2dp, &hfp), config.clone()),
                a2dp,
                hfp,
                holds: |r| matches!(r, ServiceRequest::FindRole),
                held: Vec::new(),
                requests: Vec::new(),
                events: Vec::new(),
                timers: Vec::new(),
            })
            .collect();
        Self {
            nodes,
            link_up: true,
            drop_after: None,
            hold_commit: false,
            held_commit: None,
            frames: 0,
            work: VecDeque::new(),
        }
    }

    /// Primary `0` streaming to a connected phone, secondary `1`, peer link
    /// and peer profiles up.
    pub fn pair(config: TopologyConfig) -> Self {
        let hfp = Hfp::default();
        hfp.0.lock().unwrap().insert(PHONE, 11);
        let mut bench = Self::new(
            vec![(A2dp::streaming(PHONE), hfp), (A2dp::default(), Hfp::default())],
            config,
        );
        bench.indicate(0, Indication::HandsetPaired { device: PHONE });
        for side in 0..2 {
            bench.indicate(side, Indication::PeerLinkUp);
            bench.command(side, TopologyCommand::Start);
        }
        bench.indicate(0, Indication::RoleFound { role: Role::Primary });
        bench.indicate(1, Indication::RoleFound { role: Role::Secondary });
        bench.indicate(0, Indication::AudioStarted);
        bench
    }

    pub fn command(&mut self, side: usize, cmd: TopologyCommand) {
        let effects = self.nodes[side].state.handle_command(cmd);
        self.enqueue(side, effects);
        self.run();
    }

    pub fn indicate(&mut self, side: usize, indication: Indication) {
        self.work.push_back(Work::Indicate(side, indication));
        self.run();
    }

    /// Answer everything `side`'s stack was holding on to.
    pub fn answer_held(&mut self, side: usize) {
        let held = std::mem::take(&mut self.nodes[side].held);
        for request in held {
            self.respond(side, &request);
        }
        self.run();
    }

    /// Fire every timer `side` armed so far, oldest first.
    pub fn fire_timers(&mut self, side: usize) {
        let timers = std::mem::take(&mut self.nodes[side].timers);
        for (token, _) in timers {
            let effects = self.nodes[side].state.handle_timer(token);
            self.enqueue(side, effects);
            self.run();
        }
    }

    /// Deliver the commit frame kept back by `hold_commit`.
    pub fn release_commit(&mut self) {
        if let Some((side, message, tag)) = self.held_commit.take() {
            self.send_peer(side, message, tag);
            self.run();
        }
    }

    pub fn commit_in_flight(&self) -> bool {
        self.held_commit.is_some()
    }

    pub fn role(&self, side: usize) -> Role {
        self.nodes[side].state.role()
    }

    fn enqueue(&mut self, side: usize, effects: Vec<TopologyEffect>) {
        self.work
            .extend(effects.into_iter().map(|e| Work::Effect(side, e)));
    }

    fn respond(&mut self, side: usize, request: &ServiceRequest) {
        let lru = self.nodes[side].state.handsets().least_recently_used();
        for indication in answer(request, PHONE, lru) {
            self.work.push_back(Work::Indicate(side, indication));
        }
    }

    fn run(&mut self) {
        while let Some(work) = self.work.pop_front() {
            match work {
                Work::Indicate(side, indication) => {
                    let effects = self.nodes[side].state.handle_indication(indication);
                    self.enqueue(side, effects);
                }
                Work::Effect(side, effect) => self.execute(side, effect),
            }
        }
    }

    fn execute(&mut self, side: usize, effect: TopologyEffect) {
        match effect {
            TopologyEffect::SendPeer { message, tag } => self.send_peer(side, message, tag),
            TopologyEffect::Service(request) => {
                self.nodes[side].requests.push(request.clone());
                if (self.nodes[side].holds)(&request) {
                    self.nodes[side].held.push(request);
                } else {
                    self.respond(side, &request);
                }
            }
            TopologyEffect::StartTimer { token, after } => {
                self.nodes[side].timers.push((token, after))
            }
            TopologyEffect::Emit(event) => self.nodes[side].events.push(event),
        }
    }

    fn send_peer(&mut self, side: usize, message: tws_topology::PeerMessage, tag: DeliveryTag) {
        let other = 1 - side;
        if !self.link_up || other >= self.nodes.len() {
            let effects = self.nodes[side].state.handle_delivery(tag, false);
            self.enqueue(side, effects);
            return;
        }
        if tag.commit && self.hold_commit {
            self.hold_commit = false;
            self.held_commit = Some((side, message, tag));
            return;
        }
        let bytes = message.to_bytes().expect("encode peer message");
        let effects = self.nodes[other].state.handle_peer_bytes(&bytes);
        self.enqueue(other, effects);
        if tag.commit {
            let effects = self.nodes[side].state.handle_delivery(tag, true);
            self.enqueue(side, effects);
        }

        self.frames += 1;
        if let Some(left) = self.drop_after.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                self.drop_after = None;
                self.link_up = false;
                for node in 0..self.nodes.len() {
                    self.work.push_back(Work::Indicate(node, Indication::PeerLinkDown));
                }
            }
        }
    }
}
