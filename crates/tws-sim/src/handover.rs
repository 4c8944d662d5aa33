/// Handover scenario: the primary role bounces between the two earbuds
/// while the handset streams, and the media, voice and remote-control
/// state must follow it intact.
use std::time::Instant;

use tws_topology::{HandoverReason, Indication, Role, TopologyConfig, TopologyEvent};

use crate::earbud::{Earbud, StackFaults, PHONE};
use crate::profiles::{PlayStatus, Remote};
use crate::scenario::{await_idle, bring_up, indicate, spawn_pair, RunReport, STEP_TIMEOUT};

pub async fn run(
    config: TopologyConfig,
    faults: StackFaults,
    count: u32,
    reason: HandoverReason,
) -> anyhow::Result<RunReport> {
    let start = Instant::now();
    let mut report = RunReport::new("handover", start);
    let (mut left, mut right, _link) = spawn_pair(&config, faults, start);

    let up = report
        .phase("bring up", async {
            let detail = bring_up(&mut left, &right, 3).await?;
            left.media.start_stream(PHONE, 0x40);
            left.voice.set_gains(PHONE, 9, 4);
            left.remote
                .connect(PHONE, Remote::PLAYBACK_STATUS_CHANGED | Remote::VOLUME_CHANGED);
            left.remote.play_status(PHONE, PlayStatus::Playing);
            indicate(&left, Indication::AudioStarted).await?;
            await_idle(&mut [&mut left, &mut right]).await?;
            Ok(detail)
        })
        .await;

    let mut pair = [left, right];
    if up {
        // Index of the current primary.
        let mut primary = 0;
        for round in 1..=count {
            let [a, b] = &mut pair;
            let (from, to) = if primary == 0 { (a, b) } else { (b, a) };
            let name = format!("handover {round}: {} -> {}", from.name, to.name);
            if !report.phase(name, swap(from, to, reason)).await {
                break;
            }
            primary = 1 - primary;
        }
    }

    report.close(&[&pair[0], &pair[1]]).await;
    for earbud in &pair {
        earbud.handle.shutdown().await;
    }
    Ok(report)
}

async fn swap(from: &mut Earbud, to: &mut Earbud, reason: HandoverReason) -> Result<String, String> {
    from.media.tick(PHONE);
    from.remote.set_volume(PHONE, 70);
    let stream = from.media.stream(PHONE);
    let gains = from.voice.gains(PHONE);
    let remote = from.remote.session(PHONE);

    from.handle
        .request_handover(reason)
        .await
        .map_err(|e| e.to_string())?;

    let outcome = |e: &TopologyEvent| {
        matches!(
            e,
            TopologyEvent::HandoverCompleted { .. } | TopologyEvent::HandoverFailed { .. }
        )
    };
    if let TopologyEvent::HandoverFailed { error, .. } = from.wait_for(STEP_TIMEOUT, outcome).await? {
        return Err(format!("{}: {error}", from.name));
    }
    if let TopologyEvent::HandoverFailed { error, .. } = to.wait_for(STEP_TIMEOUT, outcome).await? {
        return Err(format!("{}: {error}", to.name));
    }

    let roles = (from.role().await?, to.role().await?);
    if roles != (Role::Secondary, Role::Primary) {
        return Err(format!("roles after handover: {roles:?}"));
    }
    if to.media.stream(PHONE) != stream || from.media.stream(PHONE).is_some() {
        return Err("media stream did not move".into());
    }
    if to.voice.gains(PHONE) != gains {
        return Err("voice gains did not move".into());
    }
    if to.remote.session(PHONE) != remote || from.remote.session(PHONE).is_some() {
        return Err("remote control session did not move".into());
    }
    await_idle(&mut [&mut *from, &mut *to]).await?;

    let metrics = from.handle.metrics().await.map_err(|e| e.to_string())?;
    Ok(format!("{} state bytes sent", metrics.marshal_bytes.get()))
}
