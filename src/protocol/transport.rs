use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use super::messages::{AgentId, Envelope};
use super::ProtocolError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Unknown receiver: {0}")]
    UnknownReceiver(AgentId),
    #[error("Mailbox of {0} is closed")]
    MailboxClosed(AgentId),
    #[error(transparent)]
    Encoding(#[from] ProtocolError),
}

/// Delivery of encoded envelopes between agents. Frames from one sender reach
/// each receiver in send order.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

pub type Mailbox = mpsc::UnboundedReceiver<String>;

/// In-process bus: one unbounded JSON frame queue per registered agent.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    mailboxes: Arc<RwLock<HashMap<AgentId, mpsc::UnboundedSender<String>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` and hand back its mailbox. Re-registering replaces the
    /// previous mailbox.
    pub async fn register(&self, name: impl Into<AgentId>) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.insert(name.into(), tx);
        rx
    }

    pub async fn deregister(&self, name: &str) {
        self.mailboxes.write().await.remove(name);
    }

    /// Push a raw frame, bypassing encoding.
    pub async fn send_raw(&self, to: &str, frame: String) -> Result<(), TransportError> {
        let mailboxes = self.mailboxes.read().await;
        let tx = mailboxes
            .get(to)
            .ok_or_else(|| TransportError::UnknownReceiver(to.to_string()))?;
        tx.send(frame)
            .map_err(|_| TransportError::MailboxClosed(to.to_string()))
    }
}

#[async_trait]
impl Transport for LocalBus {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = envelope.to_json()?;
        for to in &envelope.receivers {
            trace!(from = %envelope.sender, %to, reference = envelope.reference(), performative = %envelope.performative, "Deliver");
            self.send_raw(to, frame.clone()).await?;
        }
        Ok(())
    }
}
