use itertools::Itertools;

use crate::domain::{Feeder, PrunedBranch, TopologyError};

/// A switch straddling a feeder and a pruned branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftPoint {
    pub switch: String,
    /// Energised sector of the receiving feeder.
    pub target: String,
    /// Branch sector that becomes the root of the grafted subtree.
    pub branch_root: String,
}

/// All switches with one terminal on a healthy sector of `feeder` and the
/// other inside `branch`, ordered by switch name.
pub fn find_graft_points(feeder: &Feeder, branch: &PrunedBranch) -> Vec<GraftPoint> {
    feeder
        .switches
        .values()
        .chain(branch.switches.values())
        .unique_by(|s| s.name.clone())
        .filter_map(|s| {
            let [a, b] = s.terminals();
            let (target, root) = if branch.contains(b) { (a, b) } else { (b, a) };
            let healthy = feeder.sectors.get(target).map(|t| !t.faulted).unwrap_or(false);
            (healthy && branch.contains(root) && !feeder.contains(root)).then(|| GraftPoint {
                switch: s.name.clone(),
                target: target.to_string(),
                branch_root: root.to_string(),
            })
        })
        .sorted_by(|x, y| x.switch.cmp(&y.switch))
        .collect()
}

pub fn has_graft_point(feeder: &Feeder, branch: &PrunedBranch) -> bool {
    !find_graft_points(feeder, branch).is_empty()
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraftOutcome {
    Grafted(GraftPoint),
    /// No switch reaches the branch; it is handed back untouched.
    NoGraftPoint(PrunedBranch),
}

/// Graft `branch` through its first graft point.
pub fn graft_branch(feeder: &mut Feeder, branch: PrunedBranch) -> Result<GraftOutcome, TopologyError> {
    let Some(point) = find_graft_points(feeder, &branch).into_iter().next() else {
        return Ok(GraftOutcome::NoGraftPoint(branch));
    };
    feeder.graft(&point.target, branch, &point.branch_root)?;
    Ok(GraftOutcome::Grafted(point))
}
