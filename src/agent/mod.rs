//! Autonomous agents exchanging envelopes over a [`Transport`].
//!
//! Every agent runs one loop that owns its state outright. Timers never touch
//! that state: a delayed action is a task posted back onto the agent's own
//! queue and handled in turn with everything else.

pub mod device;
pub mod feeder;
pub mod relay;
pub mod state;

use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::domain::Topology;
use crate::hardware::BreakerDriver;
use crate::power_flow::LoadFlowSolver;
use crate::protocol::{AgentId, Envelope, LocalBus, Transport, TransportError};

pub use device::DeviceAgent;
pub use feeder::{FeederAgent, FeederTask};
pub use relay::ProtectionRelay;
pub use state::FeederAgentState;

/// Observable milestones of the restoration process.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    FaultIsolated {
        feeder: AgentId,
        faulted_sector: String,
        pruned: Vec<String>,
    },
    NegotiationStarted {
        feeder: AgentId,
        receivers: Vec<AgentId>,
    },
    BidSubmitted {
        agent: AgentId,
        power_va: Option<f64>,
    },
    RoundClosed {
        feeder: AgentId,
        winner: Option<AgentId>,
    },
    BranchesRestored {
        agent: AgentId,
        grafted: Vec<String>,
        remaining: Vec<String>,
    },
    /// The initiator has no pending branches left.
    RestorationComplete { feeder: AgentId },
    /// Every peer was asked and branches are still de-energised.
    RestorationUnresolved {
        feeder: AgentId,
        remaining: Vec<String>,
    },
    SwitchOperated {
        device: AgentId,
        switch: String,
        closed: bool,
    },
}

/// Handles shared by every agent.
#[derive(Clone)]
pub struct AgentContext {
    pub transport: Arc<dyn Transport>,
    events: broadcast::Sender<AgentEvent>,
}

impl AgentContext {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { transport, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }

    pub(crate) async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        self.transport.send(envelope).await
    }
}

/// Post `task` onto `queue` once `delay` has elapsed.
pub(crate) fn schedule<T: Send + 'static>(queue: &mpsc::UnboundedSender<T>, delay: Duration, task: T) {
    let queue = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // The agent may have stopped meanwhile.
        let _ = queue.send(task);
    });
}

/// Running agents of one network.
pub struct AgentSet {
    pub feeders: Vec<JoinHandle<FeederAgentState>>,
    pub others: Vec<JoinHandle<()>>,
}

impl AgentSet {
    /// Wait for every agent to stop and hand back the final feeder states.
    pub async fn join(self) -> Vec<FeederAgentState> {
        for result in join_all(self.others).await {
            if let Err(e) = result {
                warn!(error = %e, "agent task failed");
            }
        }
        join_all(self.feeders)
            .await
            .into_iter()
            .filter_map(|r| match r {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(error = %e, "feeder agent task failed");
                    None
                }
            })
            .collect()
    }
}

/// Register and start the feeder agents, device agents and the optional
/// scripted relay described by `cfg`. An empty feeder list means one agent per
/// feeder in `topology`.
pub async fn spawn_agents(
    cfg: &Config,
    topology: &Topology,
    bus: &LocalBus,
    driver: Arc<dyn BreakerDriver>,
    solver: Arc<dyn LoadFlowSolver>,
    ctx: &AgentContext,
    cancel: &CancellationToken,
) -> Result<AgentSet> {
    let feeders: Vec<AgentId> = if cfg.agents.feeders.is_empty() {
        topology.feeders.keys().cloned().collect()
    } else {
        cfg.agents.feeders.clone()
    };

    let mut set = AgentSet {
        feeders: Vec::with_capacity(feeders.len()),
        others: Vec::new(),
    };

    for name in &feeders {
        let peers = feeders.iter().filter(|p| *p != name).cloned().collect();
        let state = FeederAgentState::new(name.clone(), topology.clone())?;
        let agent = FeederAgent::new(
            state,
            peers,
            cfg.agents.device_for(name).map(|d| d.name.clone()),
            ctx.clone(),
            solver.clone(),
            cfg.restoration.limits(),
            cfg.negotiation.clone(),
        );
        let mailbox = bus.register(name.clone()).await;
        set.feeders.push(tokio::spawn(agent.run(mailbox, cancel.child_token())));
    }

    for device in &cfg.agents.devices {
        topology.feeder(&device.feeder)?;
        let agent = DeviceAgent::new(
            device.name.clone(),
            device.feeder.clone(),
            driver.clone(),
            ctx.clone(),
        );
        let mailbox = bus.register(device.name.clone()).await;
        set.others.push(tokio::spawn(agent.run(mailbox, cancel.child_token())));
    }

    if let Some(fault) = &cfg.fault {
        let relay = ProtectionRelay::new("relay", &cfg.agents.devices, driver.clone(), ctx.clone());
        let mailbox = bus.register("relay").await;
        set.others.push(tokio::spawn(relay.run(
            fault.clone(),
            mailbox,
            cancel.child_token(),
        )));
    }

    info!(
        feeders = feeders.len(),
        devices = cfg.agents.devices.len(),
        relay = cfg.fault.is_some(),
        "agents spawned"
    );
    Ok(set)
}
