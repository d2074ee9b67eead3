//! Device agent: the field side of one feeder. Acknowledges trips from the
//! protection relay, forwards them to the feeder agent and executes its
//! switching commands. The feeder agent holds the only live model of the
//! feeder, so fault location happens there.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AgentContext, AgentEvent};
use crate::hardware::{BreakerDriver, BreakerPosition};
use crate::protocol::{
    AgentId, Content, Envelope, FaultReport, Mailbox, Performative, RequestEvent,
    RequestInitiator, RequestResponder, SwitchCommand, TripNotice,
};

pub struct DeviceAgent {
    name: AgentId,
    /// Feeder served; its agent carries the same name.
    feeder: String,
    driver: Arc<dyn BreakerDriver>,
    ctx: AgentContext,
    reports: HashMap<Uuid, RequestInitiator>,
}

impl DeviceAgent {
    pub fn new(
        name: impl Into<AgentId>,
        feeder: impl Into<String>,
        driver: Arc<dyn BreakerDriver>,
        ctx: AgentContext,
    ) -> Self {
        Self {
            name: name.into(),
            feeder: feeder.into(),
            driver,
            ctx,
            reports: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) {
        info!(agent = %self.name, feeder = %self.feeder, "device agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = mailbox.recv() => {
                    let Some(frame) = frame else { break };
                    match Envelope::from_json(&frame) {
                        Ok(envelope) => {
                            if let Err(e) = self.handle_message(envelope).await {
                                warn!(agent = %self.name, error = %e, "message handling failed");
                            }
                        }
                        Err(e) => debug!(agent = %self.name, error = %e, "dropping malformed frame"),
                    }
                }
            }
        }
        info!(agent = %self.name, "device agent stopped");
    }

    async fn handle_message(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.performative == Performative::Request {
            let mut responder = RequestResponder::accept(&envelope)?;
            return match &envelope.content {
                Content::DeviceAuth(notice) => self.on_trip(&mut responder, notice).await,
                Content::DeviceCommand(command) => self.on_command(&mut responder, command).await,
                other => {
                    debug!(agent = %self.name, reference = other.reference(), "unhandled request ignored");
                    Ok(())
                }
            };
        }

        let Some(mut report) = self.reports.remove(&envelope.conversation_id) else {
            debug!(agent = %self.name, from = %envelope.sender, "ignoring message outside any open conversation");
            return Ok(());
        };
        match report.handle(&envelope)? {
            RequestEvent::Informed(reply) => match reply.content {
                Content::IsolationConfirm(confirm) => info!(
                    agent = %self.name,
                    faulted = %confirm.faulted_sector,
                    pruned = ?confirm.pruned,
                    "isolation confirmed"
                ),
                other => debug!(agent = %self.name, reference = other.reference(), "fault report answered"),
            },
            RequestEvent::Refused(reply) => {
                warn!(agent = %self.name, content = ?reply.content, "fault report refused")
            }
            RequestEvent::Agreed(_) => {
                self.reports.insert(envelope.conversation_id, report);
            }
        }
        Ok(())
    }

    /// Acknowledge the trip and hand it over to the feeder agent.
    async fn on_trip(&mut self, responder: &mut RequestResponder, notice: &TripNotice) -> Result<()> {
        let ack = responder.inform(&self.name, Content::DeviceAuth(notice.clone()))?;
        self.ctx.send(&ack).await?;
        info!(agent = %self.name, switch = %notice.switch, "trip received, reporting fault");

        let (request, envelope) = RequestInitiator::start(
            &self.name,
            vec![self.feeder.clone()],
            Content::FaultReport(FaultReport {
                feeder: self.feeder.clone(),
                switch: notice.switch.clone(),
            }),
        );
        self.reports.insert(request.conversation_id(), request);
        self.ctx.send(&envelope).await?;
        Ok(())
    }

    async fn on_command(&mut self, responder: &mut RequestResponder, command: &SwitchCommand) -> Result<()> {
        let position = BreakerPosition::from_closed(command.close);
        let reply = match self.driver.operate(&command.switch, position).await {
            Ok(()) => {
                info!(agent = %self.name, switch = %command.switch, ?position, "switch operated");
                self.ctx.emit(AgentEvent::SwitchOperated {
                    device: self.name.clone(),
                    switch: command.switch.clone(),
                    closed: command.close,
                });
                responder.inform(&self.name, Content::DeviceCommand(command.clone()))?
            }
            Err(e) => {
                warn!(agent = %self.name, switch = %command.switch, error = %e, "switch command failed");
                responder.refuse(&self.name, Content::refusal(e.to_string()))?
            }
        };
        self.ctx.send(&reply).await?;
        Ok(())
    }
}
