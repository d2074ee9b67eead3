//! Request protocol: one initiator asks, each addressed responder answers
//! with exactly one terminal INFORM or REFUSE (optionally preceded by AGREE).

use std::collections::BTreeSet;
use strum::Display;
use uuid::Uuid;

use super::messages::{AgentId, Content, Envelope, Performative, ProtocolKind};
use super::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InitiatorState {
    Idle,
    AwaitingResponse,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResponderState {
    Idle,
    Responding,
    Done,
}

/// What a reply meant to the initiator.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEvent {
    Agreed(AgentId),
    Informed(Envelope),
    Refused(Envelope),
}

/// Initiator side of one request conversation. A request may be addressed to
/// several responders; it is done once each of them has sent a terminal reply.
#[derive(Debug, Clone)]
pub struct RequestInitiator {
    state: InitiatorState,
    conversation_id: Uuid,
    request: Content,
    awaiting: BTreeSet<AgentId>,
}

impl RequestInitiator {
    pub fn start(sender: &str, responders: Vec<AgentId>, content: Content) -> (Self, Envelope) {
        let envelope = Envelope::new(
            Performative::Request,
            ProtocolKind::Request,
            sender,
            responders.clone(),
            content.clone(),
        );
        let state = if responders.is_empty() {
            InitiatorState::Done
        } else {
            InitiatorState::AwaitingResponse
        };
        let initiator = Self {
            state,
            conversation_id: envelope.conversation_id,
            request: content,
            awaiting: responders.into_iter().collect(),
        };
        (initiator, envelope)
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == InitiatorState::Done
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Content of the original request.
    pub fn request(&self) -> &Content {
        &self.request
    }

    pub fn awaiting(&self) -> impl Iterator<Item = &AgentId> {
        self.awaiting.iter()
    }

    pub fn handle(&mut self, reply: &Envelope) -> Result<RequestEvent, ProtocolError> {
        if reply.conversation_id != self.conversation_id {
            return Err(ProtocolError::WrongConversation(reply.conversation_id));
        }
        if self.state != InitiatorState::AwaitingResponse {
            return Err(ProtocolError::UnexpectedPerformative {
                performative: reply.performative,
                state: self.state.to_string(),
            });
        }
        if !self.awaiting.contains(&reply.sender) {
            return Err(ProtocolError::UnknownParty(reply.sender.clone()));
        }

        let event = match reply.performative {
            Performative::Agree => return Ok(RequestEvent::Agreed(reply.sender.clone())),
            Performative::Inform => RequestEvent::Informed(reply.clone()),
            Performative::Refuse => RequestEvent::Refused(reply.clone()),
            other => {
                return Err(ProtocolError::UnexpectedPerformative {
                    performative: other,
                    state: self.state.to_string(),
                })
            }
        };
        self.awaiting.remove(&reply.sender);
        if self.awaiting.is_empty() {
            self.state = InitiatorState::Done;
        }
        Ok(event)
    }

    /// Give up on silent responders. Returns the ones that never answered.
    pub fn expire(&mut self) -> Vec<AgentId> {
        self.state = InitiatorState::Done;
        std::mem::take(&mut self.awaiting).into_iter().collect()
    }
}

/// Responder side: guarantees a single terminal reply per request.
#[derive(Debug, Clone)]
pub struct RequestResponder {
    state: ResponderState,
    request: Envelope,
}

impl RequestResponder {
    pub fn accept(request: &Envelope) -> Result<Self, ProtocolError> {
        if request.performative != Performative::Request {
            return Err(ProtocolError::UnexpectedPerformative {
                performative: request.performative,
                state: ResponderState::Idle.to_string(),
            });
        }
        Ok(Self {
            state: ResponderState::Responding,
            request: request.clone(),
        })
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn request(&self) -> &Envelope {
        &self.request
    }

    pub fn agree(&self, from: &str) -> Result<Envelope, ProtocolError> {
        self.ensure_responding(Performative::Agree)?;
        Ok(self
            .request
            .reply(from, Performative::Agree, self.request.content.clone()))
    }

    pub fn inform(&mut self, from: &str, content: Content) -> Result<Envelope, ProtocolError> {
        self.terminal(from, Performative::Inform, content)
    }

    pub fn refuse(&mut self, from: &str, content: Content) -> Result<Envelope, ProtocolError> {
        self.terminal(from, Performative::Refuse, content)
    }

    fn terminal(
        &mut self,
        from: &str,
        performative: Performative,
        content: Content,
    ) -> Result<Envelope, ProtocolError> {
        self.ensure_responding(performative)?;
        self.state = ResponderState::Done;
        Ok(self.request.reply(from, performative, content))
    }

    fn ensure_responding(&self, performative: Performative) -> Result<(), ProtocolError> {
        if self.state != ResponderState::Responding {
            return Err(ProtocolError::UnexpectedPerformative {
                performative,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }
}
