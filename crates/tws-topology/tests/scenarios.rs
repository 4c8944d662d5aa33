/// Scenario tests: whole topology states driven through a synchronous
/// bench, with peer frames crossing the real wire encoding.
mod common;

use common::{Bench, A2dp, Hfp, PHONE, TABLET};
use tws_topology::{
    GoalId, HandoverError, HandoverReason, Indication, Role, RuleEvents, ServiceRequest, Setting,
    TopologyCommand, TopologyConfig, TopologyEffect, TopologyEvent,
};

fn single(config: TopologyConfig) -> Bench {
    common::init_tracing();
    Bench::new(vec![(A2dp::default(), Hfp::default())], config)
}

fn request_handover(bench: &mut Bench) {
    bench.command(
        0,
        TopologyCommand::RequestHandover {
            reason: HandoverReason::BatteryLevel,
        },
    );
}

// ── Handset reconnect ─────────────────────────────────────────────────

#[test]
fn clean_handset_reconnect() {
    let mut bench = single(TopologyConfig::default());
    bench.indicate(0, Indication::HandsetPaired { device: PHONE });
    bench.command(0, TopologyCommand::Start);

    let node = &bench.nodes[0];
    for setting in [
        Setting::LeConnectionAllowed,
        Setting::HandsetConnectable,
        Setting::HandsetConnectAllowed,
    ] {
        assert!(node.requests.contains(&ServiceRequest::Configure {
            setting,
            enable: true
        }));
    }
    assert!(node
        .requests
        .iter()
        .any(|r| matches!(r, ServiceRequest::ReconnectHandset { .. })));
    assert!(node.events.contains(&TopologyEvent::HandsetConnected { device: PHONE }));
    assert!(node.state.goals().goals.is_empty(), "no goal left active");
    assert_eq!(node.state.events(), RuleEvents::NONE);

    // Link loss reconnects, and the link-loss event is consumed.
    bench.indicate(
        0,
        Indication::HandsetDisconnected {
            device: PHONE,
            link_loss: true,
        },
    );
    let node = &bench.nodes[0];
    assert!(node.state.handsets().is_connected(PHONE));
    assert!(!node.state.events().contains(RuleEvents::HANDSET_LINKLOSS));
    assert!(node.state.goals().goals.is_empty());
    assert_eq!(node.state.metrics().goals_failed.get(), 0);
}

#[test]
fn deferred_rule_runs_once_the_blocking_goal_clears() {
    let mut bench = single(TopologyConfig::default());
    bench.nodes[0].holds = |r| {
        matches!(
            r,
            ServiceRequest::FindRole | ServiceRequest::ReconnectHandset { .. }
        )
    };
    bench.indicate(0, Indication::HandsetPaired { device: PHONE });
    bench.command(0, TopologyCommand::Start);
    assert!(bench.nodes[0].state.goals().is_active(GoalId::ConnectHandset));

    bench.command(0, TopologyCommand::DisconnectLruHandset);
    let node = &bench.nodes[0];
    assert!(node
        .state
        .events()
        .contains(RuleEvents::USER_REQUEST_DISCONNECT_LRU_HANDSET));
    assert!(!node.requests.contains(&ServiceRequest::DisconnectLruHandset));

    bench.answer_held(0);
    let node = &bench.nodes[0];
    assert!(node.requests.contains(&ServiceRequest::DisconnectLruHandset));
    assert!(!node.state.handsets().is_connected(PHONE));
    assert_eq!(node.state.events(), RuleEvents::NONE);
    assert!(node.state.goals().goals.is_empty());
}

#[test]
fn settings_are_configured_once_while_the_reconnect_is_held() {
    let mut bench = single(TopologyConfig::default());
    bench.nodes[0].holds = |r| {
        matches!(
            r,
            ServiceRequest::FindRole | ServiceRequest::ReconnectHandset { .. }
        )
    };
    bench.indicate(0, Indication::HandsetPaired { device: PHONE });
    bench.command(0, TopologyCommand::Start);
    bench.indicate(0, Indication::AudioStarted);
    bench.indicate(0, Indication::AudioStopped);

    let node = &bench.nodes[0];
    let configures = node
        .requests
        .iter()
        .filter(|r| matches!(r, ServiceRequest::Configure { .. }))
        .count();
    assert_eq!(configures, 3);
    assert_eq!(node.state.metrics().goals_started.get(), 4);

    bench.answer_held(0);
    let node = &bench.nodes[0];
    assert_eq!(node.state.metrics().goals_started.get(), 4);
    assert_eq!(node.state.events(), RuleEvents::NONE);
}

#[test]
fn lost_handset_is_reconnected_once_audio_stops() {
    let mut bench = single(TopologyConfig::default());
    for device in [PHONE, TABLET] {
        bench.indicate(0, Indication::HandsetPaired { device });
    }
    bench.command(0, TopologyCommand::Start);
    bench.indicate(0, Indication::HandsetConnected { device: TABLET });
    bench.indicate(0, Indication::AudioStarted);
    let reconnects = |bench: &Bench| {
        bench.nodes[0]
            .requests
            .iter()
            .filter(|r| matches!(r, ServiceRequest::ReconnectHandset { .. }))
            .count()
    };
    assert_eq!(reconnects(&bench), 1);

    bench.indicate(
        0,
        Indication::HandsetDisconnected {
            device: TABLET,
            link_loss: true,
        },
    );
    assert_eq!(reconnects(&bench), 1, "streaming from the phone is not disturbed");
    assert!(bench.nodes[0]
        .state
        .events()
        .contains(RuleEvents::HANDSET_LINKLOSS));

    bench.indicate(0, Indication::AudioStopped);
    assert_eq!(reconnects(&bench), 2);
    let node = &bench.nodes[0];
    assert!(node.state.goals().goals.is_empty());
    assert_eq!(node.state.events(), RuleEvents::NONE);
}

#[test]
fn garbage_peer_frame_is_reported_not_fatal() {
    let mut bench = single(TopologyConfig::default());
    let effects = bench.nodes[0].state.handle_peer_bytes(&[0xc1, 0x00]);
    assert!(effects
        .iter()
        .any(|e| matches!(e, TopologyEffect::Emit(TopologyEvent::Error { .. }))));
    assert_eq!(bench.role(0), Role::None);
}

// ── Handover ──────────────────────────────────────────────────────────

#[test]
fn handover_during_active_audio() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config());
    assert_eq!(bench.role(0), Role::Primary);
    assert_eq!(bench.role(1), Role::Secondary);
    let stream = bench.nodes[0].a2dp.stream(PHONE).expect("primary is streaming");

    request_handover(&mut bench);

    assert_eq!(bench.role(0), Role::Secondary);
    assert_eq!(bench.role(1), Role::Primary);

    let (old, new) = (&bench.nodes[0], &bench.nodes[1]);
    assert_eq!(new.a2dp.stream(PHONE), Some(stream));
    assert_eq!(new.hfp.gain(PHONE), Some(11));
    assert_eq!(old.a2dp.stream(PHONE), None, "old primary released its stream");
    assert_eq!(old.hfp.gain(PHONE), None);

    assert!(new.state.handsets().is_connected(PHONE));
    assert!(!old.state.handsets().is_connected(PHONE));
    assert!(old.requests.contains(&ServiceRequest::RetainLink { device: PHONE }));
    assert!(old.requests.contains(&ServiceRequest::ReleaseLink { device: PHONE }));
    assert!(old.state.leases().is_empty());

    assert!(old.events.iter().any(|e| matches!(
        e,
        TopologyEvent::HandoverCompleted {
            role: Role::Secondary,
            ..
        }
    )));
    assert!(new.events.iter().any(|e| matches!(
        e,
        TopologyEvent::HandoverCompleted {
            role: Role::Primary,
            ..
        }
    )));
    assert!(old.state.metrics().marshal_bytes.get() > 0);
    assert_eq!(old.state.metrics().handovers_committed.get(), 1);
    assert_eq!(new.state.metrics().handovers_committed.get(), 1);

    // The new primary brings up the peer profiles; nothing is left running.
    assert!(new.requests.contains(&ServiceRequest::ConnectPeerProfiles));
    assert!(old.state.goals().goals.is_empty());
    assert!(new.state.goals().goals.is_empty());
    assert!(!old.state.handover_active());
    assert!(!new.state.handover_active());
}

#[test]
fn handover_aborts_when_the_peer_link_drops_mid_marshal() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config());
    // StartReq, StartCfm and the first marshal chunk get through.
    bench.drop_after = Some(3);
    request_handover(&mut bench);

    assert_eq!(bench.role(0), Role::Primary);
    assert_eq!(bench.role(1), Role::Secondary);

    let (old, peer) = (&bench.nodes[0], &bench.nodes[1]);
    assert!(old
        .events
        .iter()
        .any(|e| matches!(e, TopologyEvent::HandoverFailed { error: HandoverError::Transport(_), .. })));
    assert!(peer
        .events
        .iter()
        .any(|e| matches!(e, TopologyEvent::HandoverFailed { .. })));

    // Rollback: nothing installed on the peer, nothing released here.
    assert!(old.a2dp.stream(PHONE).is_some());
    assert_eq!(peer.a2dp.stream(PHONE), None);
    assert_eq!(peer.a2dp.installs(), 0);
    assert!(!old.requests.iter().any(|r| matches!(r, ServiceRequest::RetainLink { .. })));
    assert!(old.state.handsets().is_connected(PHONE));
    assert!(!old.state.handover_active());
    assert!(!peer.state.handover_active());
    assert_eq!(old.state.metrics().handovers_aborted.get(), 1);
    assert!(old.events.contains(&TopologyEvent::GoalFailed {
        goal: GoalId::DynamicHandover
    }));
}

#[test]
fn peer_veto_short_circuits_marshal() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config().handover_max_retries(0));
    bench.nodes[1].a2dp.set_busy(true);
    let frames_before = bench.frames;

    request_handover(&mut bench);

    // StartReq and the vetoing StartCfm only.
    assert_eq!(bench.frames - frames_before, 2);
    assert_eq!(bench.role(0), Role::Primary);
    assert_eq!(bench.nodes[1].a2dp.installs(), 0);
    assert_eq!(bench.nodes[0].state.metrics().marshal_bytes.get(), 0);
    assert!(bench.nodes[0].events.iter().any(|e| matches!(
        e,
        TopologyEvent::HandoverFailed {
            error: HandoverError::PeerVetoed,
            ..
        }
    )));
}

#[test]
fn local_veto_sends_nothing() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config().handover_max_retries(0));
    bench.nodes[0].a2dp.set_busy(true);
    let frames_before = bench.frames;

    request_handover(&mut bench);

    assert_eq!(bench.frames, frames_before);
    assert!(bench.nodes[0].events.iter().any(|e| matches!(
        e,
        TopologyEvent::HandoverFailed {
            error: HandoverError::Vetoed { participant: "a2dp" },
            ..
        }
    )));
    assert!(bench.nodes[1].handover_events().next().is_none());
}

#[test]
fn vetoed_handover_is_retried_after_the_delay() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config().handover_max_retries(2));
    bench.nodes[1].a2dp.set_busy(true);
    request_handover(&mut bench);
    assert_eq!(bench.role(0), Role::Primary);
    assert!(bench.nodes[0].state.goals().is_active(GoalId::DynamicHandover));

    bench.nodes[1].a2dp.set_busy(false);
    bench.fire_timers(0);

    assert_eq!(bench.role(0), Role::Secondary);
    assert_eq!(bench.role(1), Role::Primary);
    let metrics = bench.nodes[0].state.metrics();
    assert_eq!(metrics.handovers_vetoed.get(), 1);
    assert_eq!(metrics.handovers_committed.get(), 1);
}

#[test]
fn new_primary_waits_for_the_commit_past_its_timer() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config());
    bench.hold_commit = true;
    request_handover(&mut bench);
    assert!(bench.commit_in_flight());
    assert_eq!(bench.role(1), Role::Secondary);

    // Whatever the incoming side armed so far expires before the commit lands.
    bench.fire_timers(1);
    assert!(bench.nodes[1].state.handover_active());
    assert!(!bench.nodes[1]
        .events
        .iter()
        .any(|e| matches!(e, TopologyEvent::HandoverFailed { .. })));

    bench.release_commit();
    assert_eq!(bench.role(0), Role::Secondary);
    assert_eq!(bench.role(1), Role::Primary);
    assert_eq!(bench.nodes[1].a2dp.stream(PHONE).map(|s| s.cid), Some(0x41));
    assert!(!bench.nodes[0].state.handover_active());
    assert!(!bench.nodes[1].state.handover_active());
}

#[test]
fn handover_ignored_on_secondary() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config());
    bench.command(
        1,
        TopologyCommand::RequestHandover {
            reason: HandoverReason::InCase,
        },
    );
    assert_eq!(bench.frames, 0);
    assert_eq!(bench.role(1), Role::Secondary);
    assert!(bench.nodes[1].state.goals().goals.is_empty());
}

#[test]
fn stop_tears_down_a_connected_primary() {
    common::init_tracing();
    let mut bench = Bench::pair(common::fast_config());
    bench.command(0, TopologyCommand::Stop);

    let node = &bench.nodes[0];
    assert!(node.events.contains(&TopologyEvent::Stopped));
    assert!(!node.state.is_started());
    assert!(node.requests.contains(&ServiceRequest::DisconnectHandsets));
    assert!(!node.state.handsets().is_connected(PHONE));
}
