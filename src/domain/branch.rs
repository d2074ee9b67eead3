use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Phasor, Rnp, Sector, Switch};

/// Subtree detached from a feeder, waiting to be grafted elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrunedBranch {
    /// Feeder the branch was cut from.
    pub origin_feeder: String,
    pub sectors: BTreeMap<String, Sector>,
    /// Excised node-depth run, re-based so the branch root has depth 0.
    pub rnp: Rnp,
    /// Switch opened to detach the branch; `None` for a branch that was
    /// built without a parent edge.
    pub root_switch: Option<String>,
    /// Every switch with a terminal inside the branch, interior and boundary
    /// alike. These are the candidates for reattachment.
    pub switches: BTreeMap<String, Switch>,
}

impl PrunedBranch {
    pub fn root(&self) -> &str {
        self.rnp.root().unwrap_or_default()
    }

    pub fn contains(&self, sector: &str) -> bool {
        self.sectors.contains_key(sector)
    }

    pub fn sector_names(&self) -> Vec<String> {
        self.rnp.sectors().map(str::to_string).collect()
    }

    pub fn demand(&self) -> Phasor {
        self.sectors.values().map(Sector::demand).sum()
    }

    pub fn len(&self) -> usize {
        self.sectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sectors.is_empty()
    }
}

/// Insert or replace `branch` in `list`, keyed by branch root.
pub fn upsert_branch(list: &mut Vec<PrunedBranch>, branch: PrunedBranch) {
    match list.iter_mut().find(|b| b.root() == branch.root()) {
        Some(existing) => *existing = branch,
        None => list.push(branch),
    }
}
