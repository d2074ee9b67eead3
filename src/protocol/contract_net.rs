//! Contract-Net protocol: one initiator calls for proposals, collects one
//! terminal reply per participant, awards the best bid and waits for the
//! winner's result.

use strum::Display;
use tracing::debug;
use uuid::Uuid;

use super::messages::{AgentId, Content, Envelope, Performative, ProtocolKind};
use super::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CnInitiatorState {
    Idle,
    CollectingBids,
    Deciding,
    AwaitingResult,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ParticipantState {
    Idle,
    Evaluating,
    Proposing,
    Refusing,
    Executing,
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bid {
    pub bidder: AgentId,
    pub power_va: f64,
}

/// Outcome of bid evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub winner: Option<Bid>,
    /// Proposers that lost, in arrival order.
    pub rejected: Vec<Bid>,
}

/// Strictly greatest positive bid; ties keep the earliest.
pub fn select_winner(bids: &[Bid]) -> Option<&Bid> {
    let mut best: Option<&Bid> = None;
    let mut best_power = 0.0;
    for bid in bids {
        if bid.power_va > best_power {
            best_power = bid.power_va;
            best = Some(bid);
        }
    }
    best
}

#[derive(Debug, Clone)]
pub struct ContractNetInitiator {
    state: CnInitiatorState,
    conversation_id: Uuid,
    receivers: Vec<AgentId>,
    replied: Vec<AgentId>,
    bids: Vec<Bid>,
    winner: Option<AgentId>,
}

impl ContractNetInitiator {
    /// Broadcast the call for proposals.
    pub fn start(sender: &str, receivers: Vec<AgentId>, task: Content) -> (Self, Envelope) {
        let cfp = Envelope::new(
            Performative::Cfp,
            ProtocolKind::ContractNet,
            sender,
            receivers.clone(),
            task,
        );
        let initiator = Self {
            state: CnInitiatorState::CollectingBids,
            conversation_id: cfp.conversation_id,
            receivers,
            replied: Vec::new(),
            bids: Vec::new(),
            winner: None,
        };
        (initiator, cfp)
    }

    pub fn state(&self) -> CnInitiatorState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == CnInitiatorState::Done
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn receivers(&self) -> &[AgentId] {
        &self.receivers
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Record a PROPOSE or REFUSE. Returns the decision once every addressed
    /// receiver has answered.
    pub fn handle_reply(&mut self, reply: &Envelope) -> Result<Option<Decision>, ProtocolError> {
        self.ensure_conversation(reply)?;
        if self.state != CnInitiatorState::CollectingBids {
            return Err(self.unexpected(reply.performative));
        }
        if !self.receivers.contains(&reply.sender) || self.replied.contains(&reply.sender) {
            return Err(ProtocolError::UnknownParty(reply.sender.clone()));
        }

        match (reply.performative, &reply.content) {
            (Performative::Propose, Content::NegotiationBid { power_va }) => {
                self.bids.push(Bid {
                    bidder: reply.sender.clone(),
                    power_va: *power_va,
                });
            }
            (Performative::Propose, _) => {
                return Err(ProtocolError::UnexpectedContent(reply.reference().to_string()))
            }
            (Performative::Refuse, _) => {}
            (other, _) => return Err(self.unexpected(other)),
        }
        self.replied.push(reply.sender.clone());

        if self.replied.len() == self.receivers.len() {
            Ok(Some(self.decide()))
        } else {
            Ok(None)
        }
    }

    /// Close bid collection early; receivers that never answered count as refusals.
    pub fn expire_bids(&mut self) -> Option<Decision> {
        if self.state != CnInitiatorState::CollectingBids {
            return None;
        }
        let silent: Vec<&AgentId> = self
            .receivers
            .iter()
            .filter(|r| !self.replied.contains(*r))
            .collect();
        debug!(conversation = %self.conversation_id, ?silent, "Bid collection timed out");
        Some(self.decide())
    }

    fn decide(&mut self) -> Decision {
        self.state = CnInitiatorState::Deciding;
        let winner = select_winner(&self.bids).cloned();
        let rejected = self
            .bids
            .iter()
            .filter(|b| winner.as_ref().map(|w| w.bidder != b.bidder).unwrap_or(true))
            .cloned()
            .collect();
        self.winner = winner.as_ref().map(|w| w.bidder.clone());
        self.state = if winner.is_some() {
            CnInitiatorState::AwaitingResult
        } else {
            CnInitiatorState::Done
        };
        Decision { winner, rejected }
    }

    /// ACCEPT_PROPOSAL for the winner carrying `award`, REJECT_PROPOSAL for
    /// every other proposer.
    pub fn award_messages(&self, sender: &str, decision: &Decision, award: Content) -> Vec<Envelope> {
        let mut out = Vec::with_capacity(decision.rejected.len() + 1);
        if let Some(winner) = &decision.winner {
            out.push(self.envelope(sender, &winner.bidder, Performative::AcceptProposal, award));
        }
        for loser in &decision.rejected {
            out.push(self.envelope(
                sender,
                &loser.bidder,
                Performative::RejectProposal,
                Content::NegotiationBid {
                    power_va: loser.power_va,
                },
            ));
        }
        out
    }

    /// Accept the winner's INFORM (or failure) and finish the round.
    pub fn handle_result(&mut self, reply: &Envelope) -> Result<(), ProtocolError> {
        self.ensure_conversation(reply)?;
        if self.state != CnInitiatorState::AwaitingResult {
            return Err(self.unexpected(reply.performative));
        }
        if self.winner.as_deref() != Some(reply.sender.as_str()) {
            return Err(ProtocolError::UnknownParty(reply.sender.clone()));
        }
        match reply.performative {
            Performative::Inform | Performative::Refuse => {
                self.state = CnInitiatorState::Done;
                Ok(())
            }
            other => Err(self.unexpected(other)),
        }
    }

    /// Stop waiting for the winner's result.
    pub fn expire_result(&mut self) {
        self.state = CnInitiatorState::Done;
    }

    fn envelope(&self, sender: &str, to: &str, performative: Performative, content: Content) -> Envelope {
        let mut env = Envelope::new(
            performative,
            ProtocolKind::ContractNet,
            sender,
            vec![to.to_string()],
            content,
        );
        env.conversation_id = self.conversation_id;
        env
    }

    fn ensure_conversation(&self, reply: &Envelope) -> Result<(), ProtocolError> {
        if reply.conversation_id != self.conversation_id {
            return Err(ProtocolError::WrongConversation(reply.conversation_id));
        }
        Ok(())
    }

    fn unexpected(&self, performative: Performative) -> ProtocolError {
        ProtocolError::UnexpectedPerformative {
            performative,
            state: self.state.to_string(),
        }
    }
}

/// Answer to an award, as seen by the participant.
#[derive(Debug, Clone, PartialEq)]
pub enum Award {
    Accepted(Content),
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ContractNetParticipant {
    state: ParticipantState,
    cfp: Envelope,
}

impl ContractNetParticipant {
    pub fn receive(cfp: &Envelope) -> Result<Self, ProtocolError> {
        if cfp.performative != Performative::Cfp {
            return Err(ProtocolError::UnexpectedPerformative {
                performative: cfp.performative,
                state: ParticipantState::Idle.to_string(),
            });
        }
        Ok(Self {
            state: ParticipantState::Evaluating,
            cfp: cfp.clone(),
        })
    }

    pub fn state(&self) -> ParticipantState {
        self.state
    }

    pub fn cfp(&self) -> &Envelope {
        &self.cfp
    }

    pub fn conversation_id(&self) -> Uuid {
        self.cfp.conversation_id
    }

    pub fn propose(&mut self, from: &str, power_va: f64) -> Result<Envelope, ProtocolError> {
        self.transition(ParticipantState::Evaluating, ParticipantState::Proposing, Performative::Propose)?;
        Ok(self
            .cfp
            .reply(from, Performative::Propose, Content::NegotiationBid { power_va }))
    }

    pub fn refuse(&mut self, from: &str, reason: &str) -> Result<Envelope, ProtocolError> {
        self.transition(ParticipantState::Evaluating, ParticipantState::Refusing, Performative::Refuse)?;
        Ok(self
            .cfp
            .reply(from, Performative::Refuse, Content::refusal(reason)))
    }

    pub fn handle_award(&mut self, award: &Envelope) -> Result<Award, ProtocolError> {
        if award.conversation_id != self.cfp.conversation_id {
            return Err(ProtocolError::WrongConversation(award.conversation_id));
        }
        match award.performative {
            Performative::AcceptProposal => {
                self.transition(ParticipantState::Proposing, ParticipantState::Executing, award.performative)?;
                Ok(Award::Accepted(award.content.clone()))
            }
            Performative::RejectProposal => {
                self.transition(ParticipantState::Proposing, ParticipantState::Done, award.performative)?;
                Ok(Award::Rejected)
            }
            other => Err(ProtocolError::UnexpectedPerformative {
                performative: other,
                state: self.state.to_string(),
            }),
        }
    }

    /// Report the executed task back to the initiator.
    pub fn inform(&mut self, from: &str, result: Content) -> Result<Envelope, ProtocolError> {
        self.transition(ParticipantState::Executing, ParticipantState::Done, Performative::Inform)?;
        Ok(self.cfp.reply(from, Performative::Inform, result))
    }

    /// Report that the awarded task could not be carried out.
    pub fn fail(&mut self, from: &str, reason: &str) -> Result<Envelope, ProtocolError> {
        self.transition(ParticipantState::Executing, ParticipantState::Done, Performative::Refuse)?;
        Ok(self
            .cfp
            .reply(from, Performative::Refuse, Content::refusal(reason)))
    }

    fn transition(
        &mut self,
        from: ParticipantState,
        to: ParticipantState,
        performative: Performative,
    ) -> Result<(), ProtocolError> {
        if self.state != from {
            return Err(ProtocolError::UnexpectedPerformative {
                performative,
                state: self.state.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }
}
