//! End-to-end fault isolation and restoration over the in-process bus.

use std::sync::Arc;
use std::time::Duration;

use self_healing_grid::agent::{
    spawn_agents, AgentContext, AgentEvent, AgentSet, DeviceAgent, FeederAgent, FeederAgentState,
    ProtectionRelay,
};
use self_healing_grid::config::{
    AgentsConfig, Config, DeviceAgentConfig, FaultConfig, NegotiationConfig,
};
use self_healing_grid::domain::{Phasor, Topology};
use self_healing_grid::hardware::{BreakerDriver, BreakerPosition, SimulatedBreaker};
use self_healing_grid::power_flow::{BackwardForwardSweep, RestorationLimits};
use self_healing_grid::protocol::{
    AgentId, Award, Content, ContractNetInitiator, ContractNetParticipant, Envelope, FaultReport,
    LocalBus, Mailbox, Performative, ProtocolKind, SwitchCommand, SyncEvent, Transport,
};
use self_healing_grid::restoration::{isolate, locate_fault};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

fn topology() -> Topology {
    Topology::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/topology.toml")).unwrap()
}

fn fast_timing() -> NegotiationConfig {
    NegotiationConfig {
        bid_timeout_ms: 500,
        cfp_settle_ms: 20,
        sync_retry_ms: 20,
    }
}

fn scenario_config(feeders: &[&str]) -> Config {
    Config {
        agents: AgentsConfig {
            feeders: feeders.iter().map(|f| f.to_string()).collect(),
            devices: feeders
                .iter()
                .map(|f| DeviceAgentConfig {
                    name: format!("dev_{f}"),
                    feeder: f.to_string(),
                })
                .collect(),
        },
        negotiation: fast_timing(),
        fault: Some(FaultConfig {
            switch: "ch1".into(),
            device: "dev_S1_AL1".into(),
            delay_ms: 10,
        }),
        ..Config::default()
    }
}

/// Collect events until `done` matches one, failing after `WAIT`.
async fn wait_for<F>(events: &mut broadcast::Receiver<AgentEvent>, done: F) -> Vec<AgentEvent>
where
    F: Fn(&AgentEvent) -> bool,
{
    let mut seen = Vec::new();
    let finished = timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            let stop = done(&event);
            seen.push(event);
            if stop {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "timed out, events so far: {seen:#?}");
    seen
}

fn state_of<'a>(states: &'a [FeederAgentState], name: &str) -> &'a FeederAgentState {
    states.iter().find(|s| s.name == name).unwrap()
}

async fn wait_for_position(driver: &SimulatedBreaker, switch: &str, position: BreakerPosition) {
    timeout(WAIT, async {
        while driver.position(switch).await.unwrap() != position {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{switch} never reached {position:?}"));
}

/// Agents of `feeders` plus their devices and the scripted relay, all live.
struct Scenario {
    cfg: Config,
    bus: LocalBus,
    ctx: AgentContext,
    events: broadcast::Receiver<AgentEvent>,
    driver: Arc<SimulatedBreaker>,
    cancel: CancellationToken,
    agents: AgentSet,
}

async fn start_scenario(feeders: &[&str]) -> Scenario {
    let topology = topology();
    let cfg = scenario_config(feeders);
    let bus = LocalBus::new();
    let ctx = AgentContext::new(Arc::new(bus.clone()));
    let events = ctx.subscribe();
    let driver = Arc::new(SimulatedBreaker::from_topology(&topology));
    let cancel = CancellationToken::new();

    let agents = spawn_agents(
        &cfg,
        &topology,
        &bus,
        driver.clone(),
        Arc::new(BackwardForwardSweep::default()),
        &ctx,
        &cancel,
    )
    .await
    .unwrap();
    Scenario {
        cfg,
        bus,
        ctx,
        events,
        driver,
        cancel,
        agents,
    }
}

fn restoration_complete(e: &AgentEvent) -> bool {
    matches!(e, AgentEvent::RestorationComplete { feeder } if feeder == "S1_AL1")
}

#[tokio::test]
async fn test_fault_on_chain_is_restored_by_neighbour() {
    let mut scenario = start_scenario(&["S1_AL1", "S1_AL2", "S2_AL1"]).await;
    let driver = scenario.driver.clone();

    let seen = wait_for(&mut scenario.events, restoration_complete).await;

    // Sector 2 holds the fault and stays on S1_AL1, flagged. Only the healthy
    // subtree below it, {3, 4} rooted at 3, is detached and offered.
    assert!(seen.contains(&AgentEvent::FaultIsolated {
        feeder: "S1_AL1".into(),
        faulted_sector: "2".into(),
        pruned: vec!["3".into()],
    }));
    assert!(seen.contains(&AgentEvent::BidSubmitted {
        agent: "S2_AL1".into(),
        power_va: None,
    }));
    assert!(seen.contains(&AgentEvent::RoundClosed {
        feeder: "S1_AL1".into(),
        winner: Some("S1_AL2".into()),
    }));
    assert!(seen.contains(&AgentEvent::BranchesRestored {
        agent: "S1_AL2".into(),
        grafted: vec!["4".into()],
        remaining: vec![],
    }));

    // Trip by the relay, isolation by S1_AL1's device, tie closed by the winner's.
    assert_eq!(driver.position("ch1").await.unwrap(), BreakerPosition::Open);
    wait_for_position(&driver, "ch2", BreakerPosition::Open).await;
    wait_for_position(&driver, "t1", BreakerPosition::Closed).await;

    scenario.cancel.cancel();
    let states = scenario.agents.join().await;
    let origin = state_of(&states, "S1_AL1");
    assert!(origin.pending.is_empty());
    assert!(origin.asked.is_empty());
    let own = origin.feeder().unwrap();
    assert_eq!(own.rnp.to_string(), "[0:R1 1:1 2:2]");
    assert!(own.sectors["2"].faulted);
    // The insertion sync reached the initiator ahead of the outcome.
    assert_eq!(
        origin.topology.feeder("S1_AL2").unwrap().rnp.to_string(),
        "[0:R2 1:A 2:4 3:3]"
    );

    let winner = state_of(&states, "S1_AL2");
    assert!(winner.pending.is_empty());
    assert_eq!(winner.feeder().unwrap().rnp.to_string(), "[0:R2 1:A 2:4 3:3]");
    assert_eq!(
        state_of(&states, "S2_AL1").feeder().unwrap().rnp.to_string(),
        "[0:R3 1:B]"
    );
}

#[tokio::test]
async fn test_fault_inside_restored_region_is_isolated() {
    let mut scenario = start_scenario(&["S1_AL1", "S1_AL2", "S2_AL1"]).await;
    wait_for(&mut scenario.events, restoration_complete).await;

    // ch3 now sits inside the region S1_AL2 picked up.
    let relay = ProtectionRelay::new(
        "relay_2",
        &scenario.cfg.agents.devices,
        scenario.driver.clone(),
        scenario.ctx.clone(),
    );
    let _acks = scenario.bus.register("relay_2").await;
    relay.trip("ch3", "dev_S1_AL2").await.unwrap();

    let seen = wait_for(&mut scenario.events, |e| {
        matches!(e, AgentEvent::FaultIsolated { feeder, .. } if feeder == "S1_AL2")
    })
    .await;
    assert!(seen.contains(&AgentEvent::FaultIsolated {
        feeder: "S1_AL2".into(),
        faulted_sector: "3".into(),
        pruned: vec![],
    }));
    assert_eq!(
        scenario.driver.position("ch3").await.unwrap(),
        BreakerPosition::Open
    );

    scenario.cancel.cancel();
    let states = scenario.agents.join().await;
    let winner = state_of(&states, "S1_AL2");
    let own = winner.feeder().unwrap();
    assert!(own.sectors["3"].faulted);
    assert!(!own.switches["ch3"].closed);
    assert!(winner.pending.is_empty());
}

#[tokio::test]
async fn test_unreachable_branch_is_reported_unresolved() {
    let mut scenario = start_scenario(&["S1_AL1", "S2_AL1"]).await;

    let seen = wait_for(&mut scenario.events, |e| {
        matches!(e, AgentEvent::RestorationUnresolved { .. })
    })
    .await;
    assert!(seen.contains(&AgentEvent::RoundClosed {
        feeder: "S1_AL1".into(),
        winner: None,
    }));
    assert!(seen.contains(&AgentEvent::RestorationUnresolved {
        feeder: "S1_AL1".into(),
        remaining: vec!["3".into()],
    }));

    scenario.cancel.cancel();
    let states = scenario.agents.join().await;
    let origin = state_of(&states, "S1_AL1");
    assert_eq!(origin.pending_roots(), vec!["3"]);
    assert!(origin.asked.contains("S2_AL1"));
}

async fn recv_envelope(mailbox: &mut Mailbox) -> Envelope {
    let frame = timeout(WAIT, mailbox.recv()).await.unwrap().unwrap();
    Envelope::from_json(&frame).unwrap()
}

#[tokio::test]
async fn test_sync_replay_and_malformed_frames() {
    let bus = LocalBus::new();
    let ctx = AgentContext::new(Arc::new(bus.clone()));
    let cancel = CancellationToken::new();
    let mut peer = bus.register("S1_AL1").await;

    let agent = FeederAgent::new(
        FeederAgentState::new("S1_AL2", topology()).unwrap(),
        vec!["S1_AL1".into()],
        None,
        ctx,
        Arc::new(BackwardForwardSweep::default()),
        RestorationLimits::default(),
        fast_timing(),
    );
    let mailbox = bus.register("S1_AL2").await;
    let handle = tokio::spawn(agent.run(mailbox, cancel.clone()));

    bus.send_raw("S1_AL2", "{not json".into()).await.unwrap();
    bus.send_raw("S1_AL2", r#"{"performative":"REQUEST"}"#.into())
        .await
        .unwrap();

    let sync = Content::TopologySync(SyncEvent::Prune {
        feeder: "S1_AL1".into(),
        sectors: vec!["3".into()],
        faulted: Some("2".into()),
    });
    for _ in 0..2 {
        let request = Envelope::new(
            Performative::Request,
            ProtocolKind::Request,
            "S1_AL1",
            vec!["S1_AL2".into()],
            sync.clone(),
        );
        bus.send(&request).await.unwrap();
        let reply = recv_envelope(&mut peer).await;
        assert_eq!(reply.performative, Performative::Inform);
        assert_eq!(reply.conversation_id, request.conversation_id);
        assert_eq!(
            reply.content,
            Content::TopologySynced {
                feeder: "S1_AL1".into()
            }
        );
    }

    cancel.cancel();
    let state = handle.await.unwrap();
    assert_eq!(state.pending_roots(), vec!["3"]);
    assert_eq!(
        state.topology.feeder("S1_AL1").unwrap().rnp.to_string(),
        "[0:R1 1:1 2:2]"
    );
}

#[tokio::test]
async fn test_jammed_switch_command_is_refused() {
    let topology = topology();
    let bus = LocalBus::new();
    let ctx = AgentContext::new(Arc::new(bus.clone()));
    let cancel = CancellationToken::new();
    let driver = Arc::new(SimulatedBreaker::from_topology(&topology));
    driver.jam("ch4").await;
    let mut feeder = bus.register("S1_AL2").await;

    let device = DeviceAgent::new("dev_S1_AL2", "S1_AL2", driver.clone(), ctx);
    let mailbox = bus.register("dev_S1_AL2").await;
    let handle = tokio::spawn(device.run(mailbox, cancel.clone()));

    for (switch, expected) in [("t1", Performative::Inform), ("ch4", Performative::Refuse)] {
        let command = Envelope::new(
            Performative::Request,
            ProtocolKind::Request,
            "S1_AL2",
            vec!["dev_S1_AL2".into()],
            Content::DeviceCommand(SwitchCommand {
                switch: switch.into(),
                close: true,
            }),
        );
        bus.send(&command).await.unwrap();
        let reply = recv_envelope(&mut feeder).await;
        assert_eq!(reply.performative, expected, "reply for {switch}");
    }
    assert_eq!(driver.position("t1").await.unwrap(), BreakerPosition::Closed);

    cancel.cancel();
    handle.await.unwrap();
}

/// Next envelope for a scripted peer, answering topology syncs on the way.
async fn next_exchange(
    bus: &LocalBus,
    me: &str,
    mailbox: &mut Mailbox,
    synced: &mut Vec<SyncEvent>,
) -> Envelope {
    loop {
        let envelope = recv_envelope(mailbox).await;
        match &envelope.content {
            Content::TopologySync(event) if envelope.performative == Performative::Request => {
                synced.push(event.clone());
                let reply = envelope.reply(
                    me,
                    Performative::Inform,
                    Content::TopologySynced {
                        feeder: event.feeder().to_string(),
                    },
                );
                bus.send(&reply).await.unwrap();
            }
            _ => return envelope,
        }
    }
}

#[tokio::test]
async fn test_partial_outcome_reopens_round_with_unasked_peers() {
    let bus = LocalBus::new();
    let ctx = AgentContext::new(Arc::new(bus.clone()));
    let mut events = ctx.subscribe();
    let cancel = CancellationToken::new();
    let _device = bus.register("dev_S1_AL1").await;
    let mut al2 = bus.register("S1_AL2").await;
    let mut s2 = bus.register("S2_AL1").await;

    let agent = FeederAgent::new(
        FeederAgentState::new("S1_AL1", topology()).unwrap(),
        vec!["S1_AL2".into(), "S2_AL1".into()],
        None,
        ctx,
        Arc::new(BackwardForwardSweep::default()),
        RestorationLimits::default(),
        fast_timing(),
    );
    let mailbox = bus.register("S1_AL1").await;
    let handle = tokio::spawn(agent.run(mailbox, cancel.clone()));

    let report = Envelope::new(
        Performative::Request,
        ProtocolKind::Request,
        "dev_S1_AL1",
        vec!["S1_AL1".into()],
        Content::FaultReport(FaultReport {
            feeder: "S1_AL1".into(),
            switch: "ch1".into(),
        }),
    );
    bus.send(&report).await.unwrap();

    // First round: S1_AL2 wins and hands everything back.
    let mut synced = Vec::new();
    let cfp = next_exchange(&bus, "S1_AL2", &mut al2, &mut synced).await;
    assert_eq!(cfp.performative, Performative::Cfp);
    assert_eq!(cfp.receivers, vec!["S1_AL2".to_string(), "S2_AL1".to_string()]);
    let mut winner = ContractNetParticipant::receive(&cfp).unwrap();
    bus.send(&winner.propose("S1_AL2", 5e5).unwrap()).await.unwrap();

    let cfp_s2 = next_exchange(&bus, "S2_AL1", &mut s2, &mut synced).await;
    assert_eq!(cfp_s2.conversation_id, cfp.conversation_id);
    let mut refuser = ContractNetParticipant::receive(&cfp_s2).unwrap();
    bus.send(&refuser.refuse("S2_AL1", "no graft point").unwrap())
        .await
        .unwrap();

    let award = next_exchange(&bus, "S1_AL2", &mut al2, &mut synced).await;
    assert_eq!(award.performative, Performative::AcceptProposal);
    let Award::Accepted(Content::NegotiationCfp { branches }) = winner.handle_award(&award).unwrap()
    else {
        panic!("award should carry the pending branches");
    };
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].root(), "3");
    let outcome = winner
        .inform("S1_AL2", Content::NegotiationOutcome { remaining: branches })
        .unwrap();
    bus.send(&outcome).await.unwrap();

    // Second round goes to the refuser only.
    let recall = next_exchange(&bus, "S2_AL1", &mut s2, &mut synced).await;
    assert_eq!(recall.performative, Performative::Cfp);
    assert_ne!(recall.conversation_id, cfp.conversation_id);
    assert_eq!(recall.receivers, vec!["S2_AL1".to_string()]);
    let mut refuser = ContractNetParticipant::receive(&recall).unwrap();
    bus.send(&refuser.refuse("S2_AL1", "no graft point").unwrap())
        .await
        .unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(e, AgentEvent::RestorationUnresolved { .. })
    })
    .await;
    let rounds: Vec<Vec<AgentId>> = seen
        .iter()
        .filter_map(|e| match e {
            AgentEvent::NegotiationStarted { receivers, .. } => Some(receivers.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        rounds,
        vec![
            vec!["S1_AL2".to_string(), "S2_AL1".to_string()],
            vec!["S2_AL1".to_string()],
        ]
    );
    assert_eq!(synced.len(), 2);
    assert!(synced
        .iter()
        .all(|e| matches!(e, SyncEvent::Prune { feeder, .. } if feeder == "S1_AL1")));

    cancel.cancel();
    let state = handle.await.unwrap();
    assert_eq!(state.pending_roots(), vec!["3"]);
    assert!(state.asked.contains("S1_AL2"));
    assert!(state.asked.contains("S2_AL1"));
}

#[tokio::test]
async fn test_winner_syncs_go_out_one_at_a_time_in_order() {
    // 1 MVA at S1: sector 3 has to come back off after the graft.
    let mut topology = topology();
    topology.substations.get_mut("S1").unwrap().transformers[0].rating_va =
        Phasor::real(1_000_000.0);
    let mut origin = topology.clone();
    let feeder = origin.feeder_mut("S1_AL1").unwrap();
    let location = locate_fault(feeder, "ch1").unwrap();
    let branches = isolate(feeder, &location).unwrap().branches;

    let mut state = FeederAgentState::new("S1_AL2", topology).unwrap();
    state
        .apply_sync(&SyncEvent::Prune {
            feeder: "S1_AL1".into(),
            sectors: vec!["3".into()],
            faulted: Some("2".into()),
        })
        .unwrap();

    let bus = LocalBus::new();
    let ctx = AgentContext::new(Arc::new(bus.clone()));
    let mut events = ctx.subscribe();
    let cancel = CancellationToken::new();
    let mut initiator = bus.register("S1_AL1").await;
    let agent = FeederAgent::new(
        state,
        vec!["S1_AL1".into()],
        None,
        ctx,
        Arc::new(BackwardForwardSweep::default()),
        RestorationLimits::default(),
        fast_timing(),
    );
    let mailbox = bus.register("S1_AL2").await;
    let handle = tokio::spawn(agent.run(mailbox, cancel.clone()));

    let (mut round, cfp) = ContractNetInitiator::start(
        "S1_AL1",
        vec!["S1_AL2".into()],
        Content::NegotiationCfp { branches },
    );
    bus.send(&cfp).await.unwrap();
    let bid = recv_envelope(&mut initiator).await;
    assert_eq!(bid.performative, Performative::Propose);
    let decision = round.handle_reply(&bid).unwrap().unwrap();
    for award in round.award_messages("S1_AL1", &decision, cfp.content.clone()) {
        bus.send(&award).await.unwrap();
    }

    let insertion = recv_envelope(&mut initiator).await;
    assert_eq!(
        insertion.content,
        Content::TopologySync(SyncEvent::Insertion {
            feeder: "S1_AL2".into(),
            target: "A".into(),
            root: "4".into(),
        })
    );
    let outcome = recv_envelope(&mut initiator).await;
    assert_eq!(outcome.performative, Performative::Inform);
    let Content::NegotiationOutcome { remaining } = &outcome.content else {
        panic!("unexpected outcome {:?}", outcome.content);
    };
    let roots: Vec<&str> = remaining.iter().map(|b| b.root()).collect();
    assert_eq!(roots, vec!["3"]);

    // The backtrack prune waits until the insertion is answered.
    assert!(timeout(Duration::from_millis(100), initiator.recv())
        .await
        .is_err());
    let synced = Content::TopologySynced {
        feeder: "S1_AL2".into(),
    };
    bus.send(&insertion.reply("S1_AL1", Performative::Inform, synced.clone()))
        .await
        .unwrap();
    let prune = recv_envelope(&mut initiator).await;
    assert_eq!(
        prune.content,
        Content::TopologySync(SyncEvent::Prune {
            feeder: "S1_AL2".into(),
            sectors: vec!["3".into()],
            faulted: None,
        })
    );
    bus.send(&prune.reply("S1_AL1", Performative::Inform, synced))
        .await
        .unwrap();

    let seen = wait_for(&mut events, |e| {
        matches!(e, AgentEvent::BranchesRestored { .. })
    })
    .await;
    assert!(seen.contains(&AgentEvent::BranchesRestored {
        agent: "S1_AL2".into(),
        grafted: vec!["4".into()],
        remaining: vec!["3".into()],
    }));

    cancel.cancel();
    let state = handle.await.unwrap();
    assert_eq!(state.feeder().unwrap().rnp.to_string(), "[0:R2 1:A 2:4]");
    assert!(state.deferred_syncs.is_empty());
}
