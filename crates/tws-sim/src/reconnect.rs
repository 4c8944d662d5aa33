/// Reconnect scenario: a single earbud with no peer keeps its handset
/// through repeated link losses.
use std::time::Instant;

use tws_topology::{Indication, MemoryPeerChannel, Role, TopologyConfig};

use crate::earbud::{Earbud, StackFaults, PHONE};
use crate::scenario::{await_handset, await_idle, indicate, RunReport};

const ATTEMPTS: u32 = 5;

pub async fn run(
    config: TopologyConfig,
    faults: StackFaults,
    cycles: u32,
) -> anyhow::Result<RunReport> {
    let start = Instant::now();
    let mut report = RunReport::new("reconnect", start);

    // The other end stays unused: no peer is ever reported.
    let (peer, _unused, _link) = MemoryPeerChannel::pair();
    let mut earbud = Earbud::spawn("solo", peer, Role::None, config, faults, start);

    let solo = &mut earbud;
    let connected = report
        .phase("start and connect", async {
            indicate(solo, Indication::HandsetPaired { device: PHONE }).await?;
            solo.handle.start().await.map_err(|e| e.to_string())?;
            await_handset(solo, ATTEMPTS).await
        })
        .await;

    if connected {
        for cycle in 1..=cycles {
            let solo = &mut earbud;
            report
                .phase(format!("link loss {cycle}"), async {
                    let loss = Indication::HandsetDisconnected {
                        device: PHONE,
                        link_loss: true,
                    };
                    indicate(solo, loss).await?;
                    await_handset(solo, ATTEMPTS).await
                })
                .await;
        }

        let solo = &mut earbud;
        report
            .phase("settled", async {
                await_idle(&mut [&mut *solo]).await?;
                let metrics = solo.handle.metrics().await.map_err(|e| e.to_string())?;
                Ok(format!(
                    "{} goals ok, {} failed",
                    metrics.goals_succeeded.get(),
                    metrics.goals_failed.get()
                ))
            })
            .await;
    }

    report.close(&[&earbud]).await;
    earbud.handle.shutdown().await;
    Ok(report)
}
