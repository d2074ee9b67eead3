use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

use crate::domain::{upsert_branch, Feeder, PrunedBranch, Topology, TopologyError};
use crate::power_flow::available_power;
use crate::protocol::{AgentId, SyncEvent};
use crate::restoration::has_graft_point;

/// Everything a feeder agent owns. Protocol handlers receive it by `&mut`
/// from the agent loop; nothing here is shared between agents.
#[derive(Debug, Clone)]
pub struct FeederAgentState {
    /// Agent name, identical to the feeder it owns.
    pub name: AgentId,
    /// Own feeder (authoritative) plus replicas of every other feeder.
    pub topology: Topology,
    /// De-energised branches awaiting restoration, keyed by root sector.
    pub pending: Vec<PrunedBranch>,
    /// Peers already asked in the current negotiation.
    pub asked: BTreeSet<AgentId>,
    pub sync_in_flight: bool,
    /// Sync events waiting for the in-flight broadcast to finish, in send order.
    pub deferred_syncs: VecDeque<SyncEvent>,
}

impl FeederAgentState {
    pub fn new(name: impl Into<AgentId>, topology: Topology) -> Result<Self, TopologyError> {
        let name = name.into();
        topology.feeder(&name)?;
        Ok(Self {
            name,
            topology,
            pending: Vec::new(),
            asked: BTreeSet::new(),
            sync_in_flight: false,
            deferred_syncs: VecDeque::new(),
        })
    }

    pub fn feeder(&self) -> Result<&Feeder, TopologyError> {
        self.topology.feeder(&self.name)
    }

    pub fn feeder_mut(&mut self) -> Result<&mut Feeder, TopologyError> {
        self.topology.feeder_mut(&self.name)
    }

    /// Margin of the own substation, computed over own feeder and sibling replicas.
    pub fn available_power(&self) -> Result<f64, TopologyError> {
        let substation = self.feeder()?.substation.clone();
        available_power(&self.topology, &substation)
    }

    /// Bid for a call for proposals: the available margin when at least one
    /// offered branch can be grafted onto the own feeder.
    pub fn evaluate_offer(&self, branches: &[PrunedBranch]) -> Result<Option<f64>, TopologyError> {
        let feeder = self.feeder()?;
        if !branches.iter().any(|b| has_graft_point(feeder, b)) {
            return Ok(None);
        }
        self.available_power().map(Some)
    }

    pub fn pending_roots(&self) -> Vec<String> {
        self.pending.iter().map(|b| b.root().to_string()).collect()
    }

    /// Peers from `peers` not asked yet, in the given order.
    pub fn unasked(&self, peers: &[AgentId]) -> Vec<AgentId> {
        peers
            .iter()
            .filter(|p| !self.asked.contains(*p))
            .cloned()
            .collect()
    }

    /// Reserve the broadcast slot for `event`. Returns the event back when it
    /// may go out now; otherwise it is queued behind the in-flight one.
    pub fn claim_sync(&mut self, event: SyncEvent) -> Option<SyncEvent> {
        if self.sync_in_flight {
            self.deferred_syncs.push_back(event);
            None
        } else {
            self.sync_in_flight = true;
            Some(event)
        }
    }

    /// Take the oldest deferred event if the broadcast slot is free.
    pub fn next_deferred_sync(&mut self) -> Option<SyncEvent> {
        if self.sync_in_flight {
            return None;
        }
        let event = self.deferred_syncs.pop_front()?;
        self.sync_in_flight = true;
        Some(event)
    }

    /// Apply a peer's sync event to the local replica. Replaying an event
    /// leaves the replica and `pending` unchanged.
    pub fn apply_sync(&mut self, event: &SyncEvent) -> Result<(), TopologyError> {
        if event.feeder() == self.name {
            return Ok(());
        }
        match event {
            SyncEvent::Prune {
                feeder,
                sectors,
                faulted,
            } => {
                let replica = self.topology.feeder_mut(feeder)?;
                if let Some(sector) = faulted {
                    if replica.contains(sector) {
                        replica.mark_faulted(sector)?;
                    }
                }
                for sector in sectors {
                    match self.topology.feeder_mut(feeder)?.prune(sector) {
                        Ok(branch) => {
                            if self.energised_elsewhere(&branch) {
                                debug!(agent = %self.name, root = %sector, "Pruned branch already energised, not pending");
                            } else {
                                upsert_branch(&mut self.pending, branch);
                            }
                        }
                        Err(TopologyError::UnknownSector(_)) => {
                            debug!(agent = %self.name, %feeder, %sector, "Prune already applied");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            SyncEvent::Insertion {
                feeder,
                target,
                root,
            } => {
                let Some(idx) = self.pending.iter().position(|b| b.contains(root)) else {
                    debug!(agent = %self.name, %feeder, %root, "Insertion of untracked branch ignored");
                    return Ok(());
                };
                let branch = self.pending.remove(idx);
                if let Err(e) = self.topology.feeder_mut(feeder)?.graft(target, branch.clone(), root) {
                    warn!(agent = %self.name, %feeder, %root, error = %e, "Replica graft failed");
                    upsert_branch(&mut self.pending, branch);
                }
            }
        }
        Ok(())
    }

    fn energised_elsewhere(&self, branch: &PrunedBranch) -> bool {
        self.topology
            .feeders
            .values()
            .filter(|f| f.name != branch.origin_feeder)
            .any(|f| branch.sectors.keys().any(|s| f.contains(s)))
    }
}
