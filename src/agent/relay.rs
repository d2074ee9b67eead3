//! Scripted protection relay: trips one breaker and notifies the device agent.

use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AgentContext;
use crate::config::{DeviceAgentConfig, FaultConfig};
use crate::hardware::{BreakerDriver, BreakerPosition};
use crate::protocol::{AgentId, Content, Envelope, Mailbox, Performative, RequestInitiator, TripNotice};

pub struct ProtectionRelay {
    name: AgentId,
    /// Feeder served by each device agent.
    feeder_of_device: HashMap<AgentId, String>,
    driver: Arc<dyn BreakerDriver>,
    ctx: AgentContext,
}

impl ProtectionRelay {
    pub fn new(
        name: impl Into<AgentId>,
        devices: &[DeviceAgentConfig],
        driver: Arc<dyn BreakerDriver>,
        ctx: AgentContext,
    ) -> Self {
        let feeder_of_device = devices
            .iter()
            .map(|d| (d.name.clone(), d.feeder.clone()))
            .collect();
        Self {
            name: name.into(),
            feeder_of_device,
            driver,
            ctx,
        }
    }

    /// Open `switch` and send the trip notice to `device`. Returns the
    /// conversation of the notice.
    pub async fn trip(&self, switch: &str, device: &str) -> Result<Uuid> {
        let feeder = self
            .feeder_of_device
            .get(device)
            .ok_or_else(|| anyhow!("device {device} is not configured"))?;
        if self.driver.position(switch).await? == BreakerPosition::Open {
            bail!("switch {switch} is already open");
        }
        self.driver.operate(switch, BreakerPosition::Open).await?;
        warn!(relay = %self.name, %switch, %feeder, "breaker tripped");

        let (request, envelope) = RequestInitiator::start(
            &self.name,
            vec![device.to_string()],
            Content::DeviceAuth(TripNotice {
                switch: switch.to_string(),
                feeder: feeder.clone(),
            }),
        );
        self.ctx.send(&envelope).await?;
        Ok(request.conversation_id())
    }

    /// Wait `fault.delay_ms`, trip, then log acknowledgements until cancelled.
    pub async fn run(self, fault: FaultConfig, mut mailbox: Mailbox, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(fault.delay_ms)) => {}
        }
        if let Err(e) = self.trip(&fault.switch, &fault.device).await {
            warn!(relay = %self.name, error = %e, "scripted trip failed");
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = mailbox.recv() => {
                    let Some(frame) = frame else { break };
                    match Envelope::from_json(&frame) {
                        Ok(reply) if reply.performative == Performative::Inform => {
                            info!(relay = %self.name, device = %reply.sender, "trip acknowledged")
                        }
                        Ok(reply) => debug!(relay = %self.name, performative = %reply.performative, "relay reply"),
                        Err(e) => debug!(relay = %self.name, error = %e, "dropping malformed frame"),
                    }
                }
            }
        }
    }
}
