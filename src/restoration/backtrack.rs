//! Constraint verification after a graft, backing off deepest-first.

use tracing::{debug, warn};

use super::RestorationError;
use crate::domain::{PrunedBranch, Topology};
use crate::power_flow::{ConstraintKind, LoadFlowSolver, PowerFlowError, RestorationLimits, Violation};

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Every constraint holds; `deferred` lists what had to be cut back out.
    Restored { deferred: Vec<PrunedBranch> },
    /// A constraint still fails with nothing left to prune.
    Abandoned {
        violation: Violation,
        deferred: Vec<PrunedBranch>,
    },
}

impl Verdict {
    pub fn deferred(&self) -> &[PrunedBranch] {
        match self {
            Self::Restored { deferred } | Self::Abandoned { deferred, .. } => deferred,
        }
    }
}

/// Checks the constraints of one feeder after a graft and prunes the grafted
/// subtree back, deepest sectors first, until they hold.
pub struct Backtracker<'a> {
    solver: &'a dyn LoadFlowSolver,
    limits: RestorationLimits,
}

impl<'a> Backtracker<'a> {
    pub fn new(solver: &'a dyn LoadFlowSolver, limits: RestorationLimits) -> Self {
        Self { solver, limits }
    }

    /// `branch_root` is the sector through which the branch entered `feeder`;
    /// depths are counted from it.
    pub fn verify(
        &self,
        topology: &mut Topology,
        feeder: &str,
        branch_root: &str,
    ) -> Result<Verdict, RestorationError> {
        let substation = topology.feeder(feeder)?.substation.clone();
        let mut deferred = Vec::new();
        let mut threshold: Option<usize> = None;

        for kind in ConstraintKind::priority_order() {
            loop {
                let Some(violation) = self.evaluate(topology, &substation, feeder, kind)? else {
                    break;
                };
                warn!(%feeder, constraint = %kind, %violation, "Constraint violated after graft");

                let Some(sector) = next_candidate(topology, feeder, branch_root, &mut threshold)? else {
                    warn!(%feeder, root = %branch_root, "No further restoration possible");
                    return Ok(Verdict::Abandoned { violation, deferred });
                };
                let pruned = topology.feeder_mut(feeder)?.prune(&sector)?;
                debug!(%feeder, %sector, depth = ?threshold, "Backtracked sector");
                deferred.push(pruned);
            }
        }
        Ok(Verdict::Restored { deferred })
    }

    fn evaluate(
        &self,
        topology: &mut Topology,
        substation: &str,
        feeder: &str,
        kind: ConstraintKind,
    ) -> Result<Option<Violation>, RestorationError> {
        match self.solver.solve(topology, substation) {
            Ok(()) => Ok(self.limits.check(kind, topology, feeder)?),
            Err(e @ (PowerFlowError::NotConverged { .. } | PowerFlowError::VoltageCollapse(_))) => {
                Ok(Some(Violation::LoadFlowDiverged {
                    feeder: feeder.to_string(),
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Smallest-named grafted sector at the current depth threshold, lowering the
/// threshold as each depth empties.
fn next_candidate(
    topology: &Topology,
    feeder: &str,
    branch_root: &str,
    threshold: &mut Option<usize>,
) -> Result<Option<String>, RestorationError> {
    let Some(grafted) = topology.feeder(feeder)?.rnp.subtree(branch_root) else {
        return Ok(None);
    };
    let mut depth = match *threshold {
        Some(d) => d,
        None => grafted.max_depth().unwrap_or(0),
    };
    loop {
        let mut at_depth = grafted.sectors_at_depth(depth);
        at_depth.sort_unstable();
        if let Some(first) = at_depth.first() {
            *threshold = Some(depth);
            return Ok(Some(first.to_string()));
        }
        if depth == 0 {
            return Ok(None);
        }
        depth -= 1;
    }
}
