//! Inter-agent messaging: envelope, protocol state machines and transport.

pub mod contract_net;
pub mod messages;
pub mod request;
pub mod transport;

use thiserror::Error;
use uuid::Uuid;

pub use contract_net::{
    select_winner, Award, Bid, CnInitiatorState, ContractNetInitiator, ContractNetParticipant, Decision,
    ParticipantState,
};
pub use messages::{
    AgentId, Content, Envelope, FaultReport, IsolationReport, Performative, ProtocolKind, SwitchCommand,
    SyncEvent, TripNotice,
};
pub use request::{RequestEvent, RequestInitiator, RequestResponder};
pub use transport::{LocalBus, Mailbox, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unexpected {performative} in state {state}")]
    UnexpectedPerformative {
        performative: Performative,
        state: String,
    },
    #[error("Unexpected content {0} for this exchange")]
    UnexpectedContent(String),
    #[error("Message from unaddressed party {0}")]
    UnknownParty(AgentId),
    #[error("Message belongs to conversation {0}")]
    WrongConversation(Uuid),
}
