/// Run report and earbud helpers shared by every scenario.
///
/// A run is a list of phases (bring-up, each handover or fault round,
/// settling). Once the earbuds are done the report folds in their handover
/// counters and the roles they ended in, so the JSONL line says who owns
/// the handset and how much state crossed the peer link.
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tws_topology::{GoalId, Indication, MemoryPeerChannel, Role, TopologyConfig, TopologyEvent};

use crate::earbud::{Earbud, StackFaults, PHONE};

/// How long a single phase may wait on the topology.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct Phase {
    pub name: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalRole {
    pub node: &'static str,
    pub role: Role,
    pub owns_stream: bool,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub event: &'static str,
    pub scenario: &'static str,
    pub phases: Vec<Phase>,
    pub roles: Vec<FinalRole>,
    /// Summed over both earbuds; each commit counts once per side.
    pub handovers_committed: u64,
    pub handovers_failed: u64,
    pub marshal_bytes: u64,
    pub total_ms: f64,
    #[serde(skip)]
    epoch: Instant,
}

impl RunReport {
    pub fn new(scenario: &'static str, epoch: Instant) -> Self {
        Self {
            event: "run_report",
            scenario,
            phases: Vec::new(),
            roles: Vec::new(),
            handovers_committed: 0,
            handovers_failed: 0,
            marshal_bytes: 0,
            total_ms: 0.0,
            epoch,
        }
    }

    /// Run one phase to completion and record it. Returns whether it passed.
    pub async fn phase<F>(&mut self, name: impl Into<String>, work: F) -> bool
    where
        F: Future<Output = Result<String, String>>,
    {
        let begun = Instant::now();
        let outcome = work.await;
        let elapsed_ms = begun.elapsed().as_secs_f64() * 1000.0;
        let (ok, note) = match outcome {
            Ok(note) => (true, (!note.is_empty()).then_some(note)),
            Err(note) => (false, Some(note)),
        };
        self.phases.push(Phase {
            name: name.into(),
            ok,
            elapsed_ms,
            note,
        });
        ok
    }

    /// Record a failure that happened outside any timed phase.
    pub fn failure(&mut self, name: impl Into<String>, note: String) {
        self.phases.push(Phase {
            name: name.into(),
            ok: false,
            elapsed_ms: 0.0,
            note: Some(note),
        });
    }

    /// Fold in the earbuds' counters and final roles, then stop the clock.
    /// Earbuds whose runtime already went away are left out.
    pub async fn close(&mut self, earbuds: &[&Earbud]) {
        for earbud in earbuds {
            if let Ok(metrics) = earbud.handle.metrics().await {
                self.handovers_committed += metrics.handovers_committed.get();
                self.handovers_failed +=
                    metrics.handovers_aborted.get() + metrics.handovers_vetoed.get();
                self.marshal_bytes += metrics.marshal_bytes.get();
            }
            if let Ok(role) = earbud.role().await {
                self.roles.push(FinalRole {
                    node: earbud.name,
                    role,
                    owns_stream: earbud.media.stream(PHONE).is_some(),
                });
            }
        }
        self.total_ms = self.epoch.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn passed(&self) -> usize {
        self.phases.iter().filter(|p| p.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.phases.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn print_summary(&self) {
        let verdict = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{verdict}] {} in {:.1}ms", self.scenario, self.total_ms);
        eprintln!(
            "  handovers: {} committed, {} failed, {} state bytes",
            self.handovers_committed, self.handovers_failed, self.marshal_bytes
        );
        for role in &self.roles {
            let stream = if role.owns_stream { ", owns stream" } else { "" };
            eprintln!("  {}: {}{stream}", role.node, role.role);
        }
        for phase in &self.phases {
            let mark = if phase.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", phase.name, phase.elapsed_ms);
            if let Some(note) = &phase.note {
                eprint!(": {note}");
            }
            eprintln!();
        }
    }
}

// ── Earbud helpers ──────────────────────────────────────────────

/// Left (discovers primary) and right (discovers secondary) on one link.
pub fn spawn_pair(
    config: &TopologyConfig,
    faults: StackFaults,
    epoch: Instant,
) -> (Earbud, Earbud, tws_topology::LinkControl) {
    let (left_peer, right_peer, link) = MemoryPeerChannel::pair();
    let left = Earbud::spawn("left", left_peer, Role::Primary, config.clone(), faults, epoch);
    let right = Earbud::spawn("right", right_peer, Role::Secondary, config.clone(), faults, epoch);
    (left, right, link)
}

pub async fn indicate(earbud: &Earbud, indication: Indication) -> Result<(), String> {
    earbud
        .handle
        .indicate(indication)
        .await
        .map_err(|e| e.to_string())
}

/// Pair the phone with `primary`, start both earbuds on a live peer link
/// and wait for the phone to connect.
pub async fn bring_up(primary: &mut Earbud, secondary: &Earbud, attempts: u32) -> Result<String, String> {
    indicate(primary, Indication::HandsetPaired { device: PHONE }).await?;
    for earbud in [&*primary, secondary] {
        indicate(earbud, Indication::PeerLinkUp).await?;
        earbud.handle.start().await.map_err(|e| e.to_string())?;
    }
    await_handset(primary, attempts).await
}

/// Wait for the handset to come up, asking again after failed pages.
pub async fn await_handset(earbud: &mut Earbud, attempts: u32) -> Result<String, String> {
    for attempt in 1..=attempts {
        let event = earbud
            .wait_for(STEP_TIMEOUT, |e| {
                matches!(
                    e,
                    TopologyEvent::HandsetConnected { device } if *device == PHONE
                ) || matches!(
                    e,
                    TopologyEvent::GoalFailed {
                        goal: GoalId::ConnectHandset
                    }
                )
            })
            .await?;
        if matches!(event, TopologyEvent::HandsetConnected { .. }) {
            return Ok(format!("connected after {attempt} attempt(s)"));
        }
        earbud
            .handle
            .connect_handset()
            .await
            .map_err(|e| e.to_string())?;
    }
    Err(format!("no connection after {attempts} attempts"))
}

/// Poll until neither earbud has goals left.
pub async fn await_idle(earbuds: &mut [&mut Earbud]) -> Result<(), String> {
    let deadline = Instant::now() + STEP_TIMEOUT;
    loop {
        let mut busy = Vec::new();
        for earbud in earbuds.iter_mut() {
            earbud.drain();
            let goals = earbud.handle.goals().await.map_err(|e| e.to_string())?;
            if !goals.goals.is_empty() {
                busy.push(format!("{}: {:?}", earbud.name, goals.goals));
            }
        }
        if busy.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(busy.join("; "));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
