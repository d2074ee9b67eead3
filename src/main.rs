use anyhow::{Context, Result};
use self_healing_grid::{agent, config, domain, hardware, protocol, telemetry};
use std::sync::Arc;
use config::Config;
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;

    let topology = domain::Topology::load(&cfg.network.topology_file).with_context(|| {
        format!("loading topology from {}", cfg.network.topology_file.display())
    })?;
    info!(
        substations = topology.substations.len(),
        feeders = topology.feeders.len(),
        "topology loaded"
    );

    if cfg.agents.devices.is_empty() {
        warn!("No device agents configured - switching commands will not reach the field");
    }

    let bus = protocol::LocalBus::new();
    let ctx = agent::AgentContext::new(Arc::new(bus.clone()));
    let driver = Arc::new(hardware::SimulatedBreaker::from_topology(&topology));
    let solver = Arc::new(cfg.power_flow.solver());
    let cancel = CancellationToken::new();

    let agents = agent::spawn_agents(&cfg, &topology, &bus, driver, solver, &ctx, &cancel).await?;

    info!("starting self-healing grid");
    telemetry::shutdown_signal().await;
    cancel.cancel();

    for state in agents.join().await {
        info!(
            feeder = %state.name,
            rnp = %state.feeder().map(|f| f.rnp.to_string()).unwrap_or_default(),
            pending = ?state.pending_roots(),
            "final feeder state"
        );
    }
    warn!("shutdown complete");
    Ok(())
}
