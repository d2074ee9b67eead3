//! Agent message envelope and the closed set of exchange payloads.
//!
//! On the wire an envelope is JSON; `content` is adjacently tagged as
//! `{"ref": "<exchange>", "dados": <payload>}` and topology sync events carry
//! an inner `tipo` tag (`poda` / `insercao`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use super::ProtocolError;
use crate::domain::PrunedBranch;

/// Stable agent name, used as the addressing key.
pub type AgentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Performative {
    Request,
    Agree,
    Refuse,
    Inform,
    Cfp,
    Propose,
    AcceptProposal,
    RejectProposal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProtocolKind {
    Request,
    ContractNet,
}

/// Trip notice sent by a protection relay to its device agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripNotice {
    pub switch: String,
    pub feeder: String,
}

/// Trip forwarded by a device agent. The feeder agent locates the fault on
/// its own model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub feeder: String,
    pub switch: String,
}

/// Feeder agent's answer to a fault report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationReport {
    pub faulted_sector: String,
    /// Roots of the branches detached downstream of the fault.
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchCommand {
    pub switch: String,
    pub close: bool,
}

/// Replicated topology change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tipo")]
pub enum SyncEvent {
    /// Subtrees rooted at `sectors` were detached from `feeder`.
    #[serde(rename = "poda")]
    Prune {
        feeder: String,
        sectors: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        faulted: Option<String>,
    },
    /// A pending branch was grafted into `feeder` under `target`, entering
    /// through its sector `root`.
    #[serde(rename = "insercao")]
    Insertion {
        feeder: String,
        target: String,
        root: String,
    },
}

impl SyncEvent {
    pub fn feeder(&self) -> &str {
        match self {
            Self::Prune { feeder, .. } | Self::Insertion { feeder, .. } => feeder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "ref", content = "dados", rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Content {
    FaultReport(FaultReport),
    IsolationConfirm(IsolationReport),
    TopologySync(SyncEvent),
    TopologySynced { feeder: String },
    DeviceAuth(TripNotice),
    DeviceCommand(SwitchCommand),
    NegotiationCfp { branches: Vec<PrunedBranch> },
    NegotiationBid { power_va: f64 },
    NegotiationOutcome { remaining: Vec<PrunedBranch> },
    Refusal { reason: String },
}

impl Content {
    /// Exchange tag, identical to the serialized `ref`.
    pub fn reference(&self) -> &str {
        self.as_ref()
    }

    pub fn refusal(reason: impl Into<String>) -> Self {
        Self::Refusal {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub performative: Performative,
    pub protocol: ProtocolKind,
    pub sender: AgentId,
    pub receivers: Vec<AgentId>,
    pub conversation_id: Uuid,
    pub content: Content,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Open a new conversation.
    pub fn new(
        performative: Performative,
        protocol: ProtocolKind,
        sender: impl Into<AgentId>,
        receivers: Vec<AgentId>,
        content: Content,
    ) -> Self {
        Self {
            performative,
            protocol,
            sender: sender.into(),
            receivers,
            conversation_id: Uuid::new_v4(),
            content,
            timestamp: Utc::now(),
        }
    }

    /// Reply to the sender within the same conversation.
    pub fn reply(&self, from: &str, performative: Performative, content: Content) -> Self {
        Self {
            performative,
            protocol: self.protocol,
            sender: from.to_string(),
            receivers: vec![self.sender.clone()],
            conversation_id: self.conversation_id,
            content,
            timestamp: Utc::now(),
        }
    }

    pub fn reference(&self) -> &str {
        self.content.reference()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_is_tagged_by_ref() {
        let content = Content::TopologySync(SyncEvent::Prune {
            feeder: "S1_AL1".into(),
            sectors: vec!["3".into()],
            faulted: None,
        });
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(
            value,
            json!({"ref": "topology-sync", "dados": {"tipo": "poda", "feeder": "S1_AL1", "sectors": ["3"]}})
        );
        assert_eq!(content.reference(), "topology-sync");
    }

    #[test]
    fn test_reference_matches_wire_tag() {
        let cases = [
            Content::NegotiationCfp { branches: vec![] },
            Content::NegotiationOutcome { remaining: vec![] },
            Content::DeviceCommand(SwitchCommand { switch: "t1".into(), close: true }),
            Content::refusal("no graft point"),
        ];
        for content in cases {
            let value = serde_json::to_value(&content).unwrap();
            assert_eq!(value["ref"], content.reference());
        }
    }

    #[test]
    fn test_envelope_json_and_reply() {
        let request = Envelope::new(
            Performative::Request,
            ProtocolKind::Request,
            "dev1",
            vec!["S1_AL1".into()],
            Content::DeviceAuth(TripNotice { switch: "ch1".into(), feeder: "S1_AL1".into() }),
        );
        let raw = request.to_json().unwrap();
        assert!(raw.contains("\"performative\":\"REQUEST\""));
        assert!(raw.contains("\"ref\":\"device-auth\""));
        assert_eq!(Envelope::from_json(&raw).unwrap(), request);

        let reply = request.reply("S1_AL1", Performative::Inform, Content::TopologySynced { feeder: "S1_AL1".into() });
        assert_eq!(reply.conversation_id, request.conversation_id);
        assert_eq!(reply.receivers, vec!["dev1".to_string()]);
    }

    #[test]
    fn test_unknown_ref_is_malformed() {
        let raw = r#"{"performative":"INFORM","protocol":"request","sender":"a","receivers":["b"],
            "conversation_id":"00000000-0000-0000-0000-000000000000",
            "content":{"ref":"weather","dados":{}},"timestamp":"2024-01-01T00:00:00Z"}"#;
        assert!(matches!(Envelope::from_json(raw), Err(ProtocolError::Malformed(_))));
    }
}
