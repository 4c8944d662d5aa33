/// Topology runtime: one async task per earbud that owns all topology state.
///
/// The application talks to it through a [`TopologyHandle`] (downward
/// requests, service indications, queries) and listens on the
/// [`TopologyEvent`] channel. Requests for the external services come out
/// of the [`ServiceBus`]; their confirmations go back in through
/// [`TopologyHandle::indicate`].
mod effect;
mod executor;
mod r#loop;
mod peer;
mod state;
mod timers;

pub use effect::{DeliveryTag, TopologyEffect};
pub use peer::{LinkControl, MemoryPeerChannel, PeerChannel};
pub use state::TopologyState;
pub use timers::{TimerOwner, TimerToken};

use tokio::sync::{mpsc, oneshot};
use tws_metrics::TopologyMetrics;

use crate::config::TopologyConfig;
use crate::error::{HandoverError, TopologyError};
use crate::events::RuleEvents;
use crate::goals::{GoalId, GoalSnapshot};
use crate::handover::ParticipantRegistry;
use crate::services::{Indication, ServiceRequest};
use crate::types::{DeviceId, HandoverReason, Role};

// ── Commands (app → runtime) ──────────────────────────────────────────

pub enum TopologyCommand {
    Start,
    Stop,
    ConnectHandset,
    DisconnectAllHandsets,
    DisconnectLruHandset,
    ProhibitHandsetConnection { prohibit: bool },
    RequestHandover { reason: HandoverReason },
    /// Confirmation or unsolicited indication from an external service.
    Indicate(Indication),
    GetRole {
        reply: oneshot::Sender<Role>,
    },
    GetGoals {
        reply: oneshot::Sender<GoalSnapshot>,
    },
    GetEvents {
        reply: oneshot::Sender<RuleEvents>,
    },
    GetMetrics {
        reply: oneshot::Sender<TopologyMetrics>,
    },
    Shutdown,
}

// ── Events (runtime → app) ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TopologyEvent {
    Started,
    Stopped,
    RoleChanged { role: Role },
    HandsetConnected { device: DeviceId },
    HandsetDisconnected { device: DeviceId },
    /// A goal's procedure failed or timed out.
    GoalFailed { goal: GoalId },
    HandoverStarted { session: u8, reason: HandoverReason },
    HandoverCompleted { session: u8, role: Role },
    HandoverFailed { session: u8, error: HandoverError },
    /// Non-fatal runtime problem.
    Error { description: String },
}

// ── TopologyHandle ────────────────────────────────────────────────────

/// Cloneable handle to a running topology.
#[derive(Clone)]
pub struct TopologyHandle {
    cmd_tx: mpsc::Sender<TopologyCommand>,
}

impl TopologyHandle {
    async fn send(&self, cmd: TopologyCommand) -> Result<(), TopologyError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TopologyError::RuntimeClosed)
    }

    async fn query<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TopologyCommand,
    ) -> Result<T, TopologyError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx)).await?;
        rx.await.map_err(|_| TopologyError::RuntimeClosed)
    }

    pub async fn start(&self) -> Result<(), TopologyError> {
        self.send(TopologyCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), TopologyError> {
        self.send(TopologyCommand::Stop).await
    }

    pub async fn connect_handset(&self) -> Result<(), TopologyError> {
        self.send(TopologyCommand::ConnectHandset).await
    }

    pub async fn disconnect_all_handsets(&self) -> Result<(), TopologyError> {
        self.send(TopologyCommand::DisconnectAllHandsets).await
    }

    pub async fn disconnect_lru_handset(&self) -> Result<(), TopologyError> {
        self.send(TopologyCommand::DisconnectLruHandset).await
    }

    /// Prohibit (`true`) or allow again (`false`) handset connections.
    pub async fn prohibit_handset_connection(&self, prohibit: bool) -> Result<(), TopologyError> {
        self.send(TopologyCommand::ProhibitHandsetConnection { prohibit })
            .await
    }

    pub async fn request_handover(&self, reason: HandoverReason) -> Result<(), TopologyError> {
        self.send(TopologyCommand::RequestHandover { reason }).await
    }

    pub async fn indicate(&self, indication: Indication) -> Result<(), TopologyError> {
        self.send(TopologyCommand::Indicate(indication)).await
    }

    pub async fn role(&self) -> Result<Role, TopologyError> {
        self.query(|reply| TopologyCommand::GetRole { reply }).await
    }

    /// Active, cancelling and queued goals in dispatch order.
    pub async fn goals(&self) -> Result<GoalSnapshot, TopologyError> {
        self.query(|reply| TopologyCommand::GetGoals { reply }).await
    }

    /// Current Event Set.
    pub async fn events(&self) -> Result<RuleEvents, TopologyError> {
        self.query(|reply| TopologyCommand::GetEvents { reply }).await
    }

    pub async fn metrics(&self) -> Result<TopologyMetrics, TopologyError> {
        self.query(|reply| TopologyCommand::GetMetrics { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(TopologyCommand::Shutdown).await;
    }
}

// ── Service bus ───────────────────────────────────────────────────────

/// Outbound side of the external services: every [`ServiceRequest`] the
/// topology issues, in order.
pub struct ServiceBus {
    rx: mpsc::Receiver<ServiceRequest>,
}

impl ServiceBus {
    pub async fn recv(&mut self) -> Option<ServiceRequest> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServiceRequest> {
        self.rx.try_recv().ok()
    }
}

// ── TopologyChannels ──────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct TopologyChannels {
    pub handle: TopologyHandle,
    pub events: mpsc::Receiver<TopologyEvent>,
    pub services: ServiceBus,
}

// ── TopologyRuntime ───────────────────────────────────────────────────

pub struct TopologyRuntime;

impl TopologyRuntime {
    /// Spawn the topology loop for one earbud.
    ///
    /// `registry` holds the handover participants in the order both nodes
    /// must agree on.
    pub fn spawn<P: PeerChannel + 'static>(
        peer: P,
        registry: ParticipantRegistry,
        config: TopologyConfig,
    ) -> TopologyChannels {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (service_tx, service_rx) = mpsc::channel(config.event_buffer);

        let state = TopologyState::new(registry, config);
        tokio::spawn(r#loop::topology_loop(peer, state, cmd_rx, service_tx, event_tx));

        TopologyChannels {
            handle: TopologyHandle { cmd_tx },
            events: event_rx,
            services: ServiceBus { rx: service_rx },
        }
    }
}
