//! Fault isolation and service restoration on the node-depth feeder model.
//!
//! Isolation cuts the faulted sector off and detaches everything below it.
//! Restoration grafts detached branches onto a healthy feeder one at a time
//! and backs each graft off, deepest sectors first, until the feeder's
//! capacity, ampacity and voltage limits hold.

pub mod backtrack;
pub mod graft;
pub mod isolation;

use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{upsert_branch, PrunedBranch, Topology, TopologyError};
use crate::power_flow::{LoadFlowSolver, PowerFlowError, RestorationLimits, Violation};

pub use backtrack::{Backtracker, Verdict};
pub use graft::{find_graft_points, graft_branch, has_graft_point, GraftOutcome, GraftPoint};
pub use isolation::{isolate, locate_fault, FaultLocation, Isolation};

#[derive(Debug, Error)]
pub enum RestorationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    PowerFlow(#[from] PowerFlowError),
}

/// One switching action taken on the restoring feeder, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum TopologyChange {
    Grafted(GraftPoint),
    /// A grafted sector was cut back out by opening `switch`.
    Backtracked {
        branch: PrunedBranch,
        switch: Option<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestorationPass {
    pub changes: Vec<TopologyChange>,
    /// Branches still de-energised, keyed by root: ones no switch reached,
    /// pieces cut back by backtracking, and anything left after an abandonment.
    pub remaining: Vec<PrunedBranch>,
    /// Set when a branch was abandoned and the rest of the list deferred.
    pub abandoned: Option<Violation>,
    /// Set when verification itself failed. The graft in progress was rolled
    /// back and the rest of the list deferred.
    pub failure: Option<String>,
}

impl RestorationPass {
    pub fn restored_any(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, TopologyChange::Grafted(_)))
    }
}

/// Restore `branches` onto `feeder`, one branch at a time against the
/// updated feeder state. An abandonment stops the pass; the branches not yet
/// tried are handed back in `remaining` for the next negotiation round.
pub fn restore_branches(
    topology: &mut Topology,
    feeder: &str,
    branches: Vec<PrunedBranch>,
    solver: &dyn LoadFlowSolver,
    limits: RestorationLimits,
) -> Result<RestorationPass, RestorationError> {
    let backtracker = Backtracker::new(solver, limits);
    let mut pass = RestorationPass::default();
    let mut queue = branches.into_iter();

    while let Some(branch) = queue.next() {
        let root = branch.root().to_string();
        let target = topology.feeder_mut(feeder)?;
        let before = target.clone();
        let point = match graft_branch(target, branch.clone()) {
            Ok(GraftOutcome::Grafted(point)) => point,
            Ok(GraftOutcome::NoGraftPoint(branch)) => {
                info!(%feeder, %root, "No graft point for branch");
                upsert_branch(&mut pass.remaining, branch);
                continue;
            }
            Err(e) => {
                warn!(%feeder, %root, error = %e, "Graft failed");
                upsert_branch(&mut pass.remaining, branch);
                continue;
            }
        };
        info!(%feeder, switch = %point.switch, target = %point.target, %root, "Branch grafted");

        let verdict = match backtracker.verify(topology, feeder, &point.branch_root) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(%feeder, %root, error = %e, "Verification failed, graft rolled back");
                *topology.feeder_mut(feeder)? = before;
                upsert_branch(&mut pass.remaining, branch);
                for rest in queue.by_ref() {
                    upsert_branch(&mut pass.remaining, rest);
                }
                pass.failure = Some(e.to_string());
                break;
            }
        };
        pass.changes.push(TopologyChange::Grafted(point));
        let abandoned = match verdict {
            Verdict::Restored { deferred } => {
                record_backtracks(&mut pass, deferred);
                None
            }
            Verdict::Abandoned { violation, deferred } => {
                record_backtracks(&mut pass, deferred);
                Some(violation)
            }
        };
        if let Some(violation) = abandoned {
            warn!(%feeder, %root, %violation, "Branch abandoned, deferring the rest");
            for rest in queue.by_ref() {
                upsert_branch(&mut pass.remaining, rest);
            }
            pass.abandoned = Some(violation);
            break;
        }
    }
    Ok(pass)
}

fn record_backtracks(pass: &mut RestorationPass, deferred: Vec<PrunedBranch>) {
    for branch in deferred {
        upsert_branch(&mut pass.remaining, branch.clone());
        pass.changes.push(TopologyChange::Backtracked {
            switch: branch.root_switch.clone(),
            branch,
        });
    }
}
