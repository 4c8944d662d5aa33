/// Chaos scenario: random handovers, peer link flaps, handset link losses,
/// connection prohibits and profile vetoes, then a check that the pair
/// settled on one primary that owns the handset state.
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tws_topology::{HandoverReason, Indication, LinkControl, Role, TopologyConfig};

use crate::earbud::{Earbud, StackFaults, PHONE};
use crate::events::{emit, EventFault};
use crate::profiles::Remote;
use crate::scenario::{await_idle, bring_up, indicate, spawn_pair, RunReport};

#[derive(Debug, Clone, Copy)]
enum Fault {
    Handover,
    LinkFlap,
    HandsetLinkLoss,
    Prohibit,
    Veto,
}

const FAULTS: [Fault; 5] = [
    Fault::Handover,
    Fault::LinkFlap,
    Fault::HandsetLinkLoss,
    Fault::Prohibit,
    Fault::Veto,
];

pub async fn run(
    config: TopologyConfig,
    faults: StackFaults,
    rounds: u32,
    seed: u64,
) -> anyhow::Result<RunReport> {
    let start = Instant::now();
    let mut report = RunReport::new("chaos", start);
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut left, mut right, link) = spawn_pair(&config, faults, start);

    let up = report
        .phase("bring up", async {
            let detail = bring_up(&mut left, &right, 5).await?;
            left.media.start_stream(PHONE, 0x40);
            left.voice.set_gains(PHONE, 7, 3);
            left.remote.connect(PHONE, Remote::VOLUME_CHANGED);
            Ok(detail)
        })
        .await;
    let mut pair = [left, right];
    if !up {
        report.close(&[&pair[0], &pair[1]]).await;
        for earbud in &pair {
            earbud.handle.shutdown().await;
        }
        return Ok(report);
    }

    for round in 1..=rounds {
        let fault = FAULTS[rng.random_range(0..FAULTS.len())];
        emit(&EventFault {
            event: "fault",
            round,
            fault: format!("{fault:?}"),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        });
        if let Err(e) = inject(fault, &mut pair, &link, &mut rng).await {
            report.failure(format!("round {round}: {fault:?}"), e);
        }
        let pause = rng.random_range(20..250);
        tokio::time::sleep(Duration::from_millis(pause)).await;
        for earbud in pair.iter_mut() {
            earbud.drain();
            earbud.media.tick(PHONE);
        }
    }

    // Let everything settle on a healthy link.
    link.restore();
    let [a, b] = &mut pair;
    for earbud in [&*a, &*b] {
        let _ = indicate(earbud, Indication::PeerLinkUp).await;
        let _ = earbud.handle.prohibit_handset_connection(false).await;
    }
    report
        .phase("settled", async {
            await_idle(&mut [&mut *a, &mut *b]).await?;
            check_ownership(a, b).await
        })
        .await;

    report.close(&[&pair[0], &pair[1]]).await;
    for earbud in &pair {
        earbud.handle.shutdown().await;
    }
    Ok(report)
}

async fn primary_of(pair: &[Earbud; 2]) -> Result<Option<usize>, String> {
    for (idx, earbud) in pair.iter().enumerate() {
        if earbud.role().await? == Role::Primary {
            return Ok(Some(idx));
        }
    }
    Ok(None)
}

async fn inject(
    fault: Fault,
    pair: &mut [Earbud; 2],
    link: &LinkControl,
    rng: &mut StdRng,
) -> Result<(), String> {
    let primary = primary_of(pair).await?;
    match fault {
        Fault::Handover => {
            if let Some(p) = primary {
                pair[p]
                    .handle
                    .request_handover(HandoverReason::External)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Fault::LinkFlap => {
            link.drop_link();
            for earbud in pair.iter() {
                indicate(earbud, Indication::PeerLinkDown).await?;
            }
            tokio::time::sleep(Duration::from_millis(rng.random_range(10..200))).await;
            link.restore();
            for earbud in pair.iter() {
                indicate(earbud, Indication::PeerLinkUp).await?;
            }
        }
        Fault::HandsetLinkLoss => {
            if let Some(p) = primary {
                indicate(
                    &pair[p],
                    Indication::HandsetDisconnected {
                        device: PHONE,
                        link_loss: true,
                    },
                )
                .await?;
            }
        }
        Fault::Prohibit => {
            if let Some(p) = primary {
                let handle = &pair[p].handle;
                handle
                    .prohibit_handset_connection(true)
                    .await
                    .map_err(|e| e.to_string())?;
                tokio::time::sleep(Duration::from_millis(rng.random_range(10..100))).await;
                handle
                    .prohibit_handset_connection(false)
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Fault::Veto => {
            let victim = rng.random_range(0..2);
            pair[victim].media.set_busy(true);
            if let Some(p) = primary {
                pair[p]
                    .handle
                    .request_handover(HandoverReason::External)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            tokio::time::sleep(Duration::from_millis(rng.random_range(10..100))).await;
            pair[victim].media.set_busy(false);
        }
    }
    Ok(())
}

/// Exactly one primary, and only it holds the handset's profile state.
async fn check_ownership(a: &Earbud, b: &Earbud) -> Result<String, String> {
    let (primary, secondary) = match (a.role().await?, b.role().await?) {
        (Role::Primary, Role::Secondary) => (a, b),
        (Role::Secondary, Role::Primary) => (b, a),
        roles => return Err(format!("roles after chaos: {roles:?}")),
    };
    if secondary.remote.session(PHONE).is_some() {
        return Err(format!("{} kept a remote control session", secondary.name));
    }
    if primary.media.stream(PHONE).is_none() || secondary.media.stream(PHONE).is_some() {
        return Err(format!(
            "media state split: {} has {:?}, {} has {:?}",
            primary.name,
            primary.media.stream(PHONE),
            secondary.name,
            secondary.media.stream(PHONE)
        ));
    }
    let metrics = primary.handle.metrics().await.map_err(|e| e.to_string())?;
    Ok(format!(
        "{} is primary; {} handovers finished there",
        primary.name,
        metrics.handovers_finished()
    ))
}
