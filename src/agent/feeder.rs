//! Feeder agent: owns one feeder, isolates faults reported by its device,
//! keeps replicas of its peers in step and negotiates restoration of
//! de-energised branches with them.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::FeederAgentState;
use super::{schedule, AgentContext, AgentEvent};
use crate::config::NegotiationConfig;
use crate::domain::{upsert_branch, PrunedBranch};
use crate::power_flow::{LoadFlowSolver, RestorationLimits};
use crate::protocol::{
    AgentId, Award, CnInitiatorState, Content, ContractNetInitiator, ContractNetParticipant,
    Decision, Envelope, FaultReport, IsolationReport, Mailbox, Performative, RequestEvent,
    RequestInitiator, RequestResponder, SwitchCommand, SyncEvent,
};
use crate::restoration::{isolate, locate_fault, restore_branches, TopologyChange};

/// Work a feeder agent posts to its own queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeederTask {
    /// Open a negotiation round with the peers not asked yet.
    StartNegotiation,
    /// The settle delay after a call for proposals has elapsed.
    EvaluateCfp(Uuid),
    BidTimeout(Uuid),
    ResultTimeout(Uuid),
    SyncTimeout(Uuid),
    /// Try to send the oldest deferred sync event.
    RetrySync,
}

pub struct FeederAgent {
    state: FeederAgentState,
    peers: Vec<AgentId>,
    device: Option<AgentId>,
    ctx: AgentContext,
    solver: Arc<dyn LoadFlowSolver>,
    limits: RestorationLimits,
    timing: NegotiationConfig,
    tasks_tx: mpsc::UnboundedSender<FeederTask>,
    tasks_rx: mpsc::UnboundedReceiver<FeederTask>,
    negotiation: Option<ContractNetInitiator>,
    participations: HashMap<Uuid, ContractNetParticipant>,
    sync_request: Option<RequestInitiator>,
    commands: HashMap<Uuid, RequestInitiator>,
}

impl FeederAgent {
    pub fn new(
        state: FeederAgentState,
        peers: Vec<AgentId>,
        device: Option<AgentId>,
        ctx: AgentContext,
        solver: Arc<dyn LoadFlowSolver>,
        limits: RestorationLimits,
        timing: NegotiationConfig,
    ) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        Self {
            state,
            peers,
            device,
            ctx,
            solver,
            limits,
            timing,
            tasks_tx,
            tasks_rx,
            negotiation: None,
            participations: HashMap::new(),
            sync_request: None,
            commands: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Serve the mailbox and the task queue until cancelled. Returns the
    /// final state.
    pub async fn run(mut self, mut mailbox: Mailbox, cancel: CancellationToken) -> FeederAgentState {
        info!(agent = %self.state.name, peers = ?self.peers, "feeder agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = mailbox.recv() => {
                    let Some(frame) = frame else { break };
                    match Envelope::from_json(&frame) {
                        Ok(envelope) => {
                            if let Err(e) = self.handle_message(envelope).await {
                                warn!(agent = %self.state.name, error = %e, "message handling failed");
                            }
                        }
                        Err(e) => debug!(agent = %self.state.name, error = %e, "dropping malformed frame"),
                    }
                }
                Some(task) = self.tasks_rx.recv() => {
                    if let Err(e) = self.handle_task(task).await {
                        warn!(agent = %self.state.name, error = %e, "task failed");
                    }
                }
            }
        }
        info!(agent = %self.state.name, "feeder agent stopped");
        self.state
    }

    async fn handle_message(&mut self, envelope: Envelope) -> Result<()> {
        let conversation = envelope.conversation_id;
        match envelope.performative {
            Performative::Request => return self.on_request(envelope).await,
            Performative::Cfp => return self.on_cfp(envelope),
            _ => {}
        }

        if self.negotiation.as_ref().map(|n| n.conversation_id()) == Some(conversation) {
            return self.on_negotiation_reply(envelope).await;
        }
        if self.participations.contains_key(&conversation) {
            return self.on_award(envelope).await;
        }
        if self.sync_request.as_ref().map(|r| r.conversation_id()) == Some(conversation) {
            return self.on_sync_reply(envelope);
        }
        if let Some(mut command) = self.commands.remove(&conversation) {
            match command.handle(&envelope)? {
                RequestEvent::Refused(reply) => {
                    warn!(agent = %self.state.name, device = %reply.sender, content = ?reply.content, "switch command refused")
                }
                RequestEvent::Informed(_) | RequestEvent::Agreed(_) => {}
            }
            if !command.is_done() {
                self.commands.insert(conversation, command);
            }
            return Ok(());
        }
        debug!(
            agent = %self.state.name,
            from = %envelope.sender,
            reference = envelope.reference(),
            "ignoring message outside any open conversation"
        );
        Ok(())
    }

    async fn handle_task(&mut self, task: FeederTask) -> Result<()> {
        match task {
            FeederTask::StartNegotiation => self.start_negotiation().await,
            FeederTask::EvaluateCfp(conversation) => self.evaluate_cfp(conversation).await,
            FeederTask::BidTimeout(conversation) => {
                let decision = match self.negotiation.as_mut() {
                    Some(n) if n.conversation_id() == conversation => n.expire_bids(),
                    _ => None,
                };
                match decision {
                    Some(decision) => self.on_decision(decision).await,
                    None => Ok(()),
                }
            }
            FeederTask::ResultTimeout(conversation) => {
                let Some(mut negotiation) = self.take_negotiation(conversation) else {
                    return Ok(());
                };
                if negotiation.is_done() {
                    return Ok(());
                }
                negotiation.expire_result();
                let winner = negotiation.winner().map(str::to_string);
                warn!(agent = %self.state.name, ?winner, "no result from winning bidder");
                self.continue_negotiation(winner).await
            }
            FeederTask::SyncTimeout(conversation) => {
                if let Some(mut request) = self.sync_request.take() {
                    if request.conversation_id() != conversation {
                        self.sync_request = Some(request);
                        return Ok(());
                    }
                    let silent = request.expire();
                    warn!(agent = %self.state.name, ?silent, "topology sync timed out");
                    self.state.sync_in_flight = false;
                }
                Ok(())
            }
            FeederTask::RetrySync => {
                if self.state.sync_in_flight {
                    schedule(&self.tasks_tx, self.timing.sync_retry(), FeederTask::RetrySync);
                    return Ok(());
                }
                match self.state.next_deferred_sync() {
                    Some(event) => self.send_sync(event).await,
                    None => Ok(()),
                }
            }
        }
    }

    fn take_negotiation(&mut self, conversation: Uuid) -> Option<ContractNetInitiator> {
        match self.negotiation.take() {
            Some(n) if n.conversation_id() == conversation => Some(n),
            other => {
                self.negotiation = other;
                None
            }
        }
    }

    // --- requests addressed to this agent ---

    async fn on_request(&mut self, envelope: Envelope) -> Result<()> {
        let mut responder = RequestResponder::accept(&envelope)?;
        let reply = match &envelope.content {
            Content::FaultReport(report) => self.on_fault_report(&mut responder, report).await?,
            Content::TopologySync(event) => match self.state.apply_sync(event) {
                Ok(()) => {
                    debug!(agent = %self.state.name, from = %envelope.sender, ?event, "replica updated");
                    responder.inform(
                        &self.state.name,
                        Content::TopologySynced {
                            feeder: event.feeder().to_string(),
                        },
                    )?
                }
                Err(e) => responder.refuse(&self.state.name, Content::refusal(e.to_string()))?,
            },
            other => {
                debug!(agent = %self.state.name, reference = other.reference(), "unhandled request ignored");
                return Ok(());
            }
        };
        self.ctx.send(&reply).await?;
        Ok(())
    }

    /// Isolate the reported fault and kick off restoration of what was cut off.
    async fn on_fault_report(
        &mut self,
        responder: &mut RequestResponder,
        report: &FaultReport,
    ) -> Result<Envelope> {
        if report.feeder != self.state.name {
            return Ok(responder.refuse(
                &self.state.name,
                Content::refusal(format!("feeder {} is not owned here", report.feeder)),
            )?);
        }

        let feeder = self.state.feeder_mut()?;
        let location = match locate_fault(feeder, &report.switch) {
            Ok(location) => location,
            Err(e) => {
                return Ok(responder.refuse(&self.state.name, Content::refusal(e.to_string()))?)
            }
        };
        let isolation = isolate(feeder, &location)?;
        let pruned = isolation.pruned_roots();
        info!(
            agent = %self.state.name,
            faulted = %location.faulted_sector,
            ?pruned,
            "fault isolated"
        );
        // The tripped breaker is already open.
        for switch in &location.isolation_switches {
            if *switch != location.tripped_switch {
                self.command_switch(switch, false).await?;
            }
        }
        for branch in isolation.branches {
            upsert_branch(&mut self.state.pending, branch);
        }
        // A new fault opens a new negotiation.
        self.state.asked.clear();

        self.queue_sync(SyncEvent::Prune {
            feeder: self.state.name.clone(),
            sectors: pruned.clone(),
            faulted: Some(location.faulted_sector.clone()),
        })
        .await?;
        self.ctx.emit(AgentEvent::FaultIsolated {
            feeder: self.state.name.clone(),
            faulted_sector: location.faulted_sector.clone(),
            pruned: pruned.clone(),
        });
        if !self.state.pending.is_empty() {
            self.tasks_tx.send(FeederTask::StartNegotiation)?;
        }

        Ok(responder.inform(
            &self.state.name,
            Content::IsolationConfirm(IsolationReport {
                faulted_sector: location.faulted_sector,
                pruned,
            }),
        )?)
    }

    // --- topology sync broadcast ---

    async fn queue_sync(&mut self, event: SyncEvent) -> Result<()> {
        match self.state.claim_sync(event) {
            Some(event) => self.send_sync(event).await,
            None => {
                debug!(agent = %self.state.name, deferred = self.state.deferred_syncs.len(), "sync deferred");
                schedule(&self.tasks_tx, self.timing.sync_retry(), FeederTask::RetrySync);
                Ok(())
            }
        }
    }

    /// Broadcast `event` to every peer. The caller holds the sync slot.
    async fn send_sync(&mut self, event: SyncEvent) -> Result<()> {
        let (request, envelope) = RequestInitiator::start(
            &self.state.name,
            self.peers.clone(),
            Content::TopologySync(event),
        );
        if request.is_done() {
            self.state.sync_in_flight = false;
            return Ok(());
        }
        schedule(
            &self.tasks_tx,
            self.timing.bid_timeout(),
            FeederTask::SyncTimeout(request.conversation_id()),
        );
        self.sync_request = Some(request);
        if let Err(e) = self.ctx.send(&envelope).await {
            self.sync_request = None;
            self.state.sync_in_flight = false;
            return Err(e.into());
        }
        Ok(())
    }

    fn on_sync_reply(&mut self, envelope: Envelope) -> Result<()> {
        let Some(request) = self.sync_request.as_mut() else {
            return Ok(());
        };
        if let RequestEvent::Refused(reply) = request.handle(&envelope)? {
            warn!(agent = %self.state.name, peer = %reply.sender, content = ?reply.content, "peer refused topology sync");
        }
        if request.is_done() {
            self.sync_request = None;
            self.state.sync_in_flight = false;
        }
        Ok(())
    }

    // --- negotiation, initiator side ---

    async fn start_negotiation(&mut self) -> Result<()> {
        if self.state.pending.is_empty() {
            return Ok(());
        }
        let receivers = self.state.unasked(&self.peers);
        if receivers.is_empty() {
            self.report_unresolved();
            return Ok(());
        }
        let (negotiation, cfp) = ContractNetInitiator::start(
            &self.state.name,
            receivers.clone(),
            Content::NegotiationCfp {
                branches: self.state.pending.clone(),
            },
        );
        info!(agent = %self.state.name, ?receivers, pending = ?self.state.pending_roots(), "call for proposals");
        schedule(
            &self.tasks_tx,
            self.timing.bid_timeout(),
            FeederTask::BidTimeout(negotiation.conversation_id()),
        );
        if let Some(previous) = self.negotiation.replace(negotiation) {
            debug!(agent = %self.state.name, conversation = %previous.conversation_id(), "superseded negotiation round");
        }
        self.ctx.emit(AgentEvent::NegotiationStarted {
            feeder: self.state.name.clone(),
            receivers,
        });
        self.ctx.send(&cfp).await?;
        Ok(())
    }

    async fn on_negotiation_reply(&mut self, envelope: Envelope) -> Result<()> {
        let Some(negotiation) = self.negotiation.as_mut() else {
            return Ok(());
        };
        match envelope.performative {
            Performative::Propose | Performative::Refuse
                if negotiation.state() == CnInitiatorState::CollectingBids =>
            {
                if let Some(decision) = negotiation.handle_reply(&envelope)? {
                    self.on_decision(decision).await?;
                }
                Ok(())
            }
            _ => self.on_outcome(envelope).await,
        }
    }

    async fn on_decision(&mut self, decision: Decision) -> Result<()> {
        let Some(negotiation) = self.negotiation.as_ref() else {
            return Ok(());
        };
        let winner = decision.winner.as_ref().map(|b| b.bidder.clone());
        info!(
            agent = %self.state.name,
            ?winner,
            power_va = decision.winner.as_ref().map(|b| b.power_va),
            rejected = decision.rejected.len(),
            "bids evaluated"
        );
        let awards = negotiation.award_messages(
            &self.state.name,
            &decision,
            Content::NegotiationCfp {
                branches: self.state.pending.clone(),
            },
        );
        let conversation = negotiation.conversation_id();
        for award in &awards {
            self.ctx.send(award).await?;
        }
        self.ctx.emit(AgentEvent::RoundClosed {
            feeder: self.state.name.clone(),
            winner: winner.clone(),
        });

        if winner.is_some() {
            schedule(
                &self.tasks_tx,
                self.timing.bid_timeout(),
                FeederTask::ResultTimeout(conversation),
            );
        } else {
            // Nobody could take the branches; those asked stay asked.
            if let Some(n) = self.take_negotiation(conversation) {
                self.state.asked.extend(n.receivers().iter().cloned());
            }
            self.report_unresolved();
        }
        Ok(())
    }

    /// Winner's INFORM (or REFUSE) closing the round.
    async fn on_outcome(&mut self, envelope: Envelope) -> Result<()> {
        let Some(mut negotiation) = self.take_negotiation(envelope.conversation_id) else {
            return Ok(());
        };
        if let Err(e) = negotiation.handle_result(&envelope) {
            self.negotiation = Some(negotiation);
            return Err(e.into());
        }
        match (envelope.performative, envelope.content) {
            (Performative::Inform, Content::NegotiationOutcome { remaining }) => {
                info!(
                    agent = %self.state.name,
                    winner = %envelope.sender,
                    remaining = remaining.len(),
                    "restoration round finished"
                );
                self.state.pending = remaining;
            }
            (_, content) => {
                warn!(agent = %self.state.name, winner = %envelope.sender, ?content, "winner could not restore");
            }
        }
        self.continue_negotiation(Some(envelope.sender)).await
    }

    async fn continue_negotiation(&mut self, winner: Option<AgentId>) -> Result<()> {
        if self.state.pending.is_empty() {
            self.state.asked.clear();
            info!(agent = %self.state.name, "all branches restored");
            self.ctx.emit(AgentEvent::RestorationComplete {
                feeder: self.state.name.clone(),
            });
            return Ok(());
        }
        if let Some(winner) = winner {
            self.state.asked.insert(winner);
        }
        if self.state.unasked(&self.peers).is_empty() {
            self.report_unresolved();
        } else {
            self.tasks_tx.send(FeederTask::StartNegotiation)?;
        }
        Ok(())
    }

    fn report_unresolved(&self) {
        let remaining = self.state.pending_roots();
        warn!(agent = %self.state.name, ?remaining, "no peer left to restore branches");
        self.ctx.emit(AgentEvent::RestorationUnresolved {
            feeder: self.state.name.clone(),
            remaining,
        });
    }

    // --- negotiation, participant side ---

    fn on_cfp(&mut self, envelope: Envelope) -> Result<()> {
        let participant = ContractNetParticipant::receive(&envelope)?;
        let conversation = participant.conversation_id();
        self.participations.insert(conversation, participant);
        // Give in-flight syncs from the initiator time to land first.
        schedule(
            &self.tasks_tx,
            self.timing.cfp_settle(),
            FeederTask::EvaluateCfp(conversation),
        );
        Ok(())
    }

    async fn evaluate_cfp(&mut self, conversation: Uuid) -> Result<()> {
        let Some(participant) = self.participations.get_mut(&conversation) else {
            return Ok(());
        };
        let offer = match &participant.cfp().content {
            Content::NegotiationCfp { branches } => self.state.evaluate_offer(branches)?,
            other => return Err(anyhow!("call for proposals carries {}", other.reference())),
        };
        let reply = match offer {
            Some(power_va) => participant.propose(&self.state.name, power_va)?,
            None => {
                let reply = participant.refuse(&self.state.name, "no graft point")?;
                self.participations.remove(&conversation);
                reply
            }
        };
        info!(agent = %self.state.name, bid = ?offer, "answered call for proposals");
        self.ctx.emit(AgentEvent::BidSubmitted {
            agent: self.state.name.clone(),
            power_va: offer,
        });
        self.ctx.send(&reply).await?;
        Ok(())
    }

    async fn on_award(&mut self, envelope: Envelope) -> Result<()> {
        let Some(mut participant) = self.participations.remove(&envelope.conversation_id) else {
            return Ok(());
        };
        let branches = match participant.handle_award(&envelope)? {
            Award::Rejected => {
                debug!(agent = %self.state.name, "proposal rejected");
                return Ok(());
            }
            Award::Accepted(Content::NegotiationCfp { branches }) => branches,
            Award::Accepted(other) => {
                let reply = participant.fail(&self.state.name, &format!("unexpected award {}", other.reference()))?;
                self.ctx.send(&reply).await?;
                return Ok(());
            }
        };

        let reply = match self.execute_restoration(branches).await {
            Ok(remaining) => participant.inform(
                &self.state.name,
                Content::NegotiationOutcome { remaining },
            )?,
            Err(e) => {
                warn!(agent = %self.state.name, error = %e, "restoration failed");
                participant.fail(&self.state.name, &e.to_string())?
            }
        };
        self.ctx.send(&reply).await?;
        Ok(())
    }

    /// Graft the awarded branches, propagate every change and drive the
    /// switches. Returns what is still de-energised.
    async fn execute_restoration(&mut self, branches: Vec<PrunedBranch>) -> Result<Vec<PrunedBranch>> {
        let offered: Vec<String> = branches.iter().map(|b| b.root().to_string()).collect();
        let pass = restore_branches(
            &mut self.state.topology,
            &self.state.name,
            branches,
            self.solver.as_ref(),
            self.limits,
        )?;

        self.state
            .pending
            .retain(|b| !offered.iter().any(|r| r == b.root()));
        for branch in &pass.remaining {
            upsert_branch(&mut self.state.pending, branch.clone());
        }

        let mut grafted = Vec::new();
        for change in &pass.changes {
            match change {
                TopologyChange::Grafted(point) => {
                    grafted.push(point.branch_root.clone());
                    self.queue_sync(SyncEvent::Insertion {
                        feeder: self.state.name.clone(),
                        target: point.target.clone(),
                        root: point.branch_root.clone(),
                    })
                    .await?;
                    self.command_switch(&point.switch, true).await?;
                }
                TopologyChange::Backtracked { branch, switch } => {
                    self.queue_sync(SyncEvent::Prune {
                        feeder: self.state.name.clone(),
                        sectors: vec![branch.root().to_string()],
                        faulted: None,
                    })
                    .await?;
                    if let Some(switch) = switch {
                        self.command_switch(switch, false).await?;
                    }
                }
            }
        }
        if let Some(violation) = &pass.abandoned {
            warn!(agent = %self.state.name, %violation, "restoration pass abandoned");
        }
        if let Some(failure) = &pass.failure {
            warn!(agent = %self.state.name, %failure, "restoration pass cut short");
        }

        let remaining: Vec<String> = pass.remaining.iter().map(|b| b.root().to_string()).collect();
        info!(agent = %self.state.name, ?grafted, ?remaining, "restoration pass done");
        self.ctx.emit(AgentEvent::BranchesRestored {
            agent: self.state.name.clone(),
            grafted,
            remaining,
        });
        Ok(pass.remaining)
    }

    async fn command_switch(&mut self, switch: &str, close: bool) -> Result<()> {
        let Some(device) = self.device.clone() else {
            debug!(agent = %self.state.name, %switch, close, "no device agent, switch left to operator");
            return Ok(());
        };
        let (request, envelope) = RequestInitiator::start(
            &self.state.name,
            vec![device],
            Content::DeviceCommand(SwitchCommand {
                switch: switch.to_string(),
                close,
            }),
        );
        self.commands.insert(request.conversation_id(), request);
        self.ctx.send(&envelope).await?;
        Ok(())
    }
}
