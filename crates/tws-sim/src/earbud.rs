/// One simulated earbud: a topology runtime plus the service stack that
/// answers its requests.
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tracing::debug;
use tws_topology::{
    DeviceId, Indication, MemoryPeerChannel, Role, ServiceBus, ServiceRequest, TopologyChannels,
    TopologyConfig, TopologyEvent, TopologyHandle, TopologyRuntime,
};

use crate::events::{emit, EventTopology};
use crate::profiles::{self, Media, Remote, Voice};

pub const PHONE: DeviceId = DeviceId::new(0);

/// How the simulated stack misbehaves.
#[derive(Debug, Clone, Copy)]
pub struct StackFaults {
    /// Probability that a handset page times out.
    pub page_failure: f64,
    /// Upper bound on confirmation latency.
    pub max_latency: Duration,
}

impl Default for StackFaults {
    fn default() -> Self {
        Self {
            page_failure: 0.0,
            max_latency: Duration::from_millis(5),
        }
    }
}

pub struct Earbud {
    pub name: &'static str,
    pub handle: TopologyHandle,
    pub media: Media,
    pub voice: Voice,
    pub remote: Remote,
    events: mpsc::Receiver<TopologyEvent>,
    epoch: Instant,
}

impl Earbud {
    /// Spawn the runtime and its stack. `role` is what role discovery
    /// reports on this earbud.
    pub fn spawn(
        name: &'static str,
        peer: MemoryPeerChannel,
        role: Role,
        config: TopologyConfig,
        faults: StackFaults,
        epoch: Instant,
    ) -> Self {
        let media = Media::default();
        let voice = Voice::default();
        let remote = Remote::default();
        let TopologyChannels {
            handle,
            events,
            services,
        } = TopologyRuntime::spawn(peer, profiles::registry(&media, &voice, &remote), config);
        tokio::spawn(run_stack(name, services, handle.clone(), role, faults));
        Self {
            name,
            handle,
            media,
            voice,
            remote,
            events,
            epoch,
        }
    }

    /// Wait up to `timeout` for an event matching `pred`, logging every
    /// event seen on the way.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&TopologyEvent) -> bool,
    ) -> Result<TopologyEvent, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| format!("{}: timeout", self.name))?
                .ok_or_else(|| format!("{}: runtime gone", self.name))?;
            self.log(&event);
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// Log whatever is queued without waiting.
    pub fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.log(&event);
        }
    }

    fn log(&self, event: &TopologyEvent) {
        emit(&EventTopology {
            event: "topology",
            node: self.name,
            detail: format!("{event:?}"),
            elapsed_ms: self.epoch.elapsed().as_secs_f64() * 1000.0,
        });
    }

    pub async fn role(&self) -> Result<Role, String> {
        self.handle.role().await.map_err(|e| e.to_string())
    }
}

async fn run_stack(
    name: &'static str,
    mut services: ServiceBus,
    handle: TopologyHandle,
    role: Role,
    faults: StackFaults,
) {
    while let Some(request) = services.recv().await {
        let answers = answer(&request, role, faults);
        debug!(node = name, ?request, answers = answers.len(), "stack");
        if !answers.is_empty() && !faults.max_latency.is_zero() {
            let ms = rand::rng().random_range(0..=faults.max_latency.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        for indication in answers {
            if handle.indicate(indication).await.is_err() {
                return;
            }
        }
    }
}

fn answer(request: &ServiceRequest, role: Role, faults: StackFaults) -> Vec<Indication> {
    match request {
        ServiceRequest::FindRole => vec![Indication::RoleFound { role }],
        ServiceRequest::Configure { setting, .. } => vec![Indication::Configured { setting: *setting }],
        ServiceRequest::ReconnectHandset { .. } => {
            if rand::rng().random_bool(faults.page_failure.clamp(0.0, 1.0)) {
                vec![Indication::ReconnectCfm { ok: false }]
            } else {
                vec![
                    Indication::HandsetConnected { device: PHONE },
                    Indication::ReconnectCfm { ok: true },
                ]
            }
        }
        ServiceRequest::StopReconnect => vec![Indication::ReconnectStopped],
        ServiceRequest::DisconnectHandsets => vec![
            Indication::HandsetDisconnected {
                device: PHONE,
                link_loss: false,
            },
            Indication::DisconnectCfm { lru: false, ok: true },
        ],
        ServiceRequest::DisconnectLruHandset => vec![
            Indication::HandsetDisconnected {
                device: PHONE,
                link_loss: false,
            },
            Indication::DisconnectCfm { lru: true, ok: true },
        ],
        ServiceRequest::ConnectPeerProfiles => vec![Indication::PeerProfilesConnected { ok: true }],
        ServiceRequest::DisconnectPeerProfiles => vec![Indication::PeerProfilesDisconnected],
        ServiceRequest::CancelFindRole
        | ServiceRequest::RetainLink { .. }
        | ServiceRequest::ReleaseLink { .. } => Vec::new(),
    }
}
